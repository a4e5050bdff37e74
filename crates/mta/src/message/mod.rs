/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::{SystemTime, UNIX_EPOCH};

use mail_parser::DateTime;
use serde::{Deserialize, Serialize};

use crate::queue::{Delivery, SpamVerdict};

pub const DEFAULT_RECEIVED_TEMPLATE: &str =
    "from queue ({zone}) by {helo} (Postrider) with ESMTP id {id}.{seq} for <{rcpt}>; {date}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// An ordered header multiset. Duplicate names are allowed and insertion
/// position is part of the contract: index 0 is the top of the block, any
/// out-of-range index appends at the bottom. The on-wire order is the sole
/// observable ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderBlock(Vec<Header>);

impl HeaderBlock {
    pub fn insert(&mut self, index: usize, name: impl Into<String>, value: impl Into<String>) {
        let index = std::cmp::min(index, self.0.len());
        self.0.insert(
            index,
            Header {
                name: name.into(),
                value: value.into(),
            },
        );
    }

    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(0, name, value);
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(usize::MAX, name, value);
    }

    pub fn get(&self, index: usize) -> Option<&Header> {
        self.0.get(index)
    }

    pub fn count(&self, name: &str) -> usize {
        self.0
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialises the block for the wire, including the blank line that
    /// separates headers from the body.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        for header in &self.0 {
            buf.extend_from_slice(header.name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(header.value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Byte length of `to_wire` without building it.
    pub fn wire_len(&self) -> usize {
        self.0
            .iter()
            .map(|h| h.name.len() + h.value.len() + 4)
            .sum::<usize>()
            + 2
    }
}

/// Renders a `Received` header value from a zone template. Placeholders:
/// `{helo}`, `{id}`, `{seq}`, `{rcpt}`, `{zone}`, `{date}`.
pub fn render_received(template: &str, delivery: &Delivery, helo: &str, zone: &str) -> String {
    let date = DateTime::from_timestamp(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()) as i64,
    )
    .to_rfc822();

    template
        .replace("{helo}", helo)
        .replace("{id}", &delivery.id)
        .replace("{seq}", &delivery.seq.to_string())
        .replace("{rcpt}", delivery.to.first().map_or("", |r| r.as_str()))
        .replace("{zone}", zone)
        .replace("{date}", &date)
}

/// Builds the `X-Zone-Spam-Status` header value: `Yes|No`, then optional
/// `score=`, `required=` and `tests=[..]` fields, joined by `, `.
pub fn spam_status_value(verdict: &SpamVerdict) -> String {
    let mut fields = Vec::with_capacity(4);
    fields.push(if verdict.is_spam() { "Yes" } else { "No" }.to_string());
    if let Some(score) = verdict.score {
        fields.push(format!("score={score}"));
    }
    if let Some(required) = verdict.required {
        fields.push(format!("required={required}"));
    }
    if !verdict.tests.is_empty() {
        fields.push(format!("tests=[{}]", verdict.tests.join(",")));
    }
    fields.join(", ")
}
