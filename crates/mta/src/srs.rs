/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

const BASE32: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const HASH_LEN: usize = 4;

/// Rewrites envelope senders into the `SRS0=<hash>=<tt>=<domain>=<local>`
/// shape so that bounces for forwarded mail return through this relay while
/// keeping SPF alignment. The rewritten localpart is meant to be placed in
/// front of `@<rewrite-domain>` by the caller.
pub struct SrsRewriter {
    key: Vec<u8>,
}

impl SrsRewriter {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        SrsRewriter { key: secret.into() }
    }

    pub fn rewrite(&self, local: &str, domain: &str) -> String {
        self.rewrite_at(local, domain, timestamp_days())
    }

    fn rewrite_at(&self, local: &str, domain: &str, days: u64) -> String {
        let domain = domain.to_ascii_lowercase();
        let tt = encode_timestamp(days);
        let hash = self.hash(&tt, &domain, local);
        format!("SRS0={hash}={tt}={domain}={local}")
    }

    fn hash(&self, tt: &str, domain: &str, local: &str) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(tt.as_bytes());
        mac.update(b"=");
        mac.update(domain.as_bytes());
        mac.update(b"=");
        mac.update(local.as_bytes());
        let digest = mac.finalize().into_bytes();
        digest
            .iter()
            .take(HASH_LEN)
            .map(|b| BASE32[(b & 0x1f) as usize] as char)
            .collect()
    }
}

// Two base32 chars encode the 10 low bits of the day counter, as in the SRS
// reference scheme.
fn encode_timestamp(days: u64) -> String {
    let days = days % 1024;
    let mut tt = String::with_capacity(2);
    tt.push(BASE32[((days >> 5) & 0x1f) as usize] as char);
    tt.push(BASE32[(days & 0x1f) as usize] as char);
    tt
}

fn timestamp_days() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
        / 86400
}
