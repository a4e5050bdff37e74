/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;

use rsa::{pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::message::HeaderBlock;

// Headers covered by the signature when present, in h= order. Received and
// trace headers are deliberately absent; they are added after signing.
const SIGNED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "reply-to",
    "subject",
    "date",
    "message-id",
    "in-reply-to",
    "references",
    "mime-version",
    "content-type",
    "list-unsubscribe",
];

#[derive(Debug)]
pub enum Error {
    UnsupportedAlgorithm(String),
    Key(String),
    Sign(String),
}

/// Produces the value of a `DKIM-Signature` header over the given header
/// block and a pre-computed body hash. The body itself never passes through
/// this function; it lives in the remote store and its hash arrives with the
/// delivery.
pub fn sign(
    headers: &HeaderBlock,
    hash_algo: &str,
    body_hash: &str,
    domain: &str,
    selector: &str,
    private_key: &str,
) -> Result<String, Error> {
    if !matches!(hash_algo, "sha256" | "rsa-sha256") {
        return Err(Error::UnsupportedAlgorithm(hash_algo.to_string()));
    }
    let key = RsaPrivateKey::from_pkcs8_pem(private_key)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key))
        .map_err(|err| Error::Key(err.to_string()))?;

    // RFC 6376 selects header instances bottom-up; with each name listed
    // once, that is the last occurrence in the block.
    let mut signed = Vec::with_capacity(SIGNED_HEADERS.len());
    for name in SIGNED_HEADERS {
        if let Some(header) = headers
            .iter()
            .rev()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            signed.push((*name, header.value.as_str()));
        }
    }

    let h = signed
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(":");
    let value = format!(
        "v=1; a=rsa-sha256; c=relaxed/relaxed; d={domain}; s={selector}; h={h}; bh={body_hash}; b="
    );

    let mut canonical = String::with_capacity(256);
    for (name, header_value) in &signed {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(&relaxed_value(header_value));
        canonical.push_str("\r\n");
    }
    canonical.push_str("dkim-signature:");
    canonical.push_str(&relaxed_value(&value));

    let digest = Sha256::digest(canonical.as_bytes()).to_vec();
    let signature = key
        .sign(
            rsa::PaddingScheme::PKCS1v15Sign {
                hash: Some(rsa::hash::Hash::SHA2_256),
            },
            &digest,
        )
        .map_err(|err| Error::Sign(err.to_string()))?;

    Ok(format!("{value}{}", base64::encode(signature)))
}

// Relaxed canonicalisation of a header value: unfold, collapse whitespace
// runs, trim.
fn relaxed_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_space = true;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnsupportedAlgorithm(algo) => {
                write!(f, "Unsupported signing algorithm {algo:?}")
            }
            Error::Key(err) => write!(f, "Failed to parse signing key: {err}"),
            Error::Sign(err) => write!(f, "Signing failed: {err}"),
        }
    }
}
