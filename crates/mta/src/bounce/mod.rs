/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceAction {
    Reject,
    Defer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceInfo {
    pub action: BounceAction,
    pub category: &'static str,
    pub message: &'static str,
}

struct Rule {
    patterns: &'static [&'static str],
    action: Option<BounceAction>,
    category: &'static str,
    message: &'static str,
}

// First match wins. Patterns are matched case-insensitively against the
// normalised reply; a rule without an action falls back to the reply-code
// severity.
static RULES: &[Rule] = &[
    Rule {
        patterns: &["greylist", "graylist", "try again later", "try later"],
        action: Some(BounceAction::Defer),
        category: "greylisting",
        message: "Greylisted by the recipient server",
    },
    Rule {
        patterns: &["rate limit", "ratelimit", "too many", "throttl", "slow down"],
        action: Some(BounceAction::Defer),
        category: "throttling",
        message: "Sending rate limited by the recipient server",
    },
    Rule {
        patterns: &["mailbox full", "over quota", "quota exceeded", "insufficient storage"],
        action: Some(BounceAction::Defer),
        category: "quota",
        message: "Recipient mailbox is full",
    },
    Rule {
        patterns: &[
            "user unknown",
            "unknown user",
            "no such user",
            "unknown recipient",
            "invalid recipient",
            "recipient rejected",
            "does not exist",
            "mailbox unavailable",
            "mailbox not found",
        ],
        action: None,
        category: "recipient",
        message: "Recipient address does not exist",
    },
    Rule {
        patterns: &["spam", "blacklist", "black list", "block list", "blocklist", "listed at"],
        action: None,
        category: "spam",
        message: "Message was classified as spam by the recipient server",
    },
    Rule {
        patterns: &["virus", "infected", "malware"],
        action: Some(BounceAction::Reject),
        category: "virus",
        message: "Message was classified as infected by the recipient server",
    },
    Rule {
        patterns: &["relay access denied", "relaying denied", "not permitted to relay"],
        action: Some(BounceAction::Reject),
        category: "relay",
        message: "Relaying denied by the recipient server",
    },
    Rule {
        patterns: &["spf", "dkim", "dmarc", "not authorized", "policy", "access denied", "administrative prohibition"],
        action: None,
        category: "policy",
        message: "Message was rejected by the recipient server policy",
    },
    Rule {
        patterns: &["message size", "size limit", "too big", "too large", "exceeds maximum"],
        action: None,
        category: "size",
        message: "Message exceeds the size accepted by the recipient server",
    },
    Rule {
        patterns: &[
            "can't find an mx",
            "can't connect to any mx",
            "connection refused",
            "connection reset",
            "connection timed out",
            "timed out",
            "timeout",
            "network unreachable",
            "host unreachable",
            "no route to host",
            "broken pipe",
            "unexpected eof",
        ],
        action: Some(BounceAction::Defer),
        category: "network",
        message: "Could not reach the recipient server",
    },
    Rule {
        patterns: &["tls", "handshake", "certificate", "starttls"],
        action: Some(BounceAction::Defer),
        category: "tls",
        message: "TLS negotiation with the recipient server failed",
    },
];

/// Maps a (normalised or raw) SMTP reply string to a bounce disposition.
/// Enhanced status codes win over keyword tables, keyword tables win over the
/// plain reply-code severity, and anything without a 5xx verdict defers.
pub fn classify(reply: &str) -> BounceInfo {
    let lower = reply.to_ascii_lowercase();
    let code = reply_code(&lower);
    let severity_action = match code {
        Some(code) if (500..600).contains(&code) => Some(BounceAction::Reject),
        Some(code) if (400..500).contains(&code) => Some(BounceAction::Defer),
        _ => None,
    };

    for rule in RULES {
        if rule.patterns.iter().any(|p| lower.contains(p)) {
            return BounceInfo {
                action: rule
                    .action
                    .or(severity_action)
                    .unwrap_or(BounceAction::Defer),
                category: rule.category,
                message: rule.message,
            };
        }
    }

    // No keyword matched; fall back to the enhanced status class, then the
    // reply code.
    if let Some((class, subject, _)) = enhanced_status(&lower) {
        let action = if class == 5 {
            BounceAction::Reject
        } else {
            BounceAction::Defer
        };
        let (category, message) = match subject {
            1 => ("recipient", "Recipient address was rejected"),
            2 => ("mailbox", "Recipient mailbox was not available"),
            4 => ("network", "Could not reach the recipient server"),
            7 => ("policy", "Message was rejected by the recipient server policy"),
            _ => ("other", "Message was not accepted by the recipient server"),
        };
        return BounceInfo {
            action,
            category,
            message,
        };
    }

    match severity_action {
        Some(BounceAction::Reject) => BounceInfo {
            action: BounceAction::Reject,
            category: "other",
            message: "Message was rejected by the recipient server",
        },
        _ => BounceInfo {
            action: BounceAction::Defer,
            category: "other",
            message: "Message could not be delivered",
        },
    }
}

/// Normalises an SMTP reply for logging and classification: newlines and runs
/// of whitespace collapse to single spaces, trailing whitespace is trimmed.
/// The reply code and any enhanced status code survive as the leading tokens.
pub fn normalize(reply: &str) -> String {
    let mut out = String::with_capacity(reply.len());
    let mut in_space = true;
    for ch in reply.chars() {
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

fn reply_code(text: &str) -> Option<u16> {
    let token = text.split_whitespace().next()?;
    let token = token.strip_suffix('-').unwrap_or(token);
    if token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

fn enhanced_status(text: &str) -> Option<(u8, u8, u16)> {
    for token in text.split_whitespace().take(3) {
        let mut parts = token.split('.');
        if let (Some(class), Some(subject), Some(detail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        {
            if class.len() == 1
                && (1..=3).contains(&subject.len())
                && (1..=3).contains(&detail.len())
                && matches!(class, "2" | "4" | "5")
                && subject.bytes().all(|b| b.is_ascii_digit())
                && detail.bytes().all(|b| b.is_ascii_digit())
            {
                return Some((
                    class.parse().ok()?,
                    subject.parse().ok()?,
                    detail.parse().ok()?,
                ));
            }
        }
    }
    None
}

impl Display for BounceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BounceAction::Reject => f.write_str("reject"),
            BounceAction::Defer => f.write_str("defer"),
        }
    }
}
