/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

use crate::message::HeaderBlock;

pub mod client;
pub mod dsn;

/// One recipient group's copy of a queued message, as handed out by the
/// queue authority in response to `GET`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Delivery {
    pub id: String,
    pub seq: u32,
    pub from: String,
    pub to: Vec<String>,
    pub domain: String,
    pub headers: HeaderBlock,
    pub body_size: usize,
    pub deferred_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spam: Option<SpamInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dkim: Option<Vec<DkimSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbl: Option<String>,
    pub message_id: String,
}

impl Delivery {
    /// Local part and domain of the envelope sender, when present.
    pub fn from_parts(&self) -> Option<(&str, &str)> {
        self.from.rsplit_once('@')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpamInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<SpamVerdict>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpamVerdict {
    pub verdict: String,
    pub score: Option<f64>,
    pub required: Option<f64>,
    pub tests: Vec<String>,
}

impl SpamVerdict {
    pub fn is_spam(&self) -> bool {
        self.verdict.eq_ignore_ascii_case("yes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimSpec {
    pub hash_algo: String,
    pub body_hash: String,
    pub keys: Vec<DkimKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimKey {
    pub domain: String,
    pub selector: String,
    pub private_key: String,
}

/// A `GET` result: the delivery plus the lock token that the terminal
/// command must present.
#[derive(Debug, Clone)]
pub struct Job {
    pub delivery: Delivery,
    pub lock: String,
}

/// Commands understood by the queue authority. One JSON object per line,
/// strictly request/response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "UPPERCASE")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Get { zone: String },
    #[serde(rename_all = "camelCase")]
    Release { id: String, seq: u32, lock: String },
    #[serde(rename_all = "camelCase")]
    Defer {
        id: String,
        seq: u32,
        lock: String,
        /// Back-off in milliseconds.
        ttl: u64,
    },
    #[serde(rename_all = "camelCase")]
    Bounce {
        id: String,
        seq: u32,
        from: String,
        to: Vec<String>,
        headers: HeaderBlock,
        return_path: String,
        category: String,
        time: u64,
        response: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Release { .. } => "RELEASE",
            Command::Defer { .. } => "DEFER",
            Command::Bounce { .. } => "BOUNCE",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GetResponse {
    pub delivery: Option<Delivery>,
    pub lock: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AckResponse {
    pub updated: bool,
}
