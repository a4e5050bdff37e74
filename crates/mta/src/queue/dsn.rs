/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::{Command, Delivery};

/// Bounce messages stop being generated once a message carries this many
/// `Received` headers; a forwarding loop is the only way to get there.
pub const MAX_RECEIVED_HOPS: usize = 25;

const MAX_WEBHOOK_RETRIES: u32 = 5;

/// Out-of-band notification for permanent rejects. The webhook is fire and
/// forget: failures retry on a detached task and are abandoned after
/// `MAX_WEBHOOK_RETRIES`, never escalated to the delivery path.
#[derive(Clone)]
pub struct BounceNotifier {
    http: reqwest::Client,
    url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BouncePayload {
    pub id: String,
    pub to: Vec<String>,
    pub seq: u32,
    pub return_path: String,
    pub category: String,
    pub time: u64,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbl: Option<String>,
}

impl BouncePayload {
    pub fn new(delivery: &Delivery, category: &str, response: &str) -> Self {
        BouncePayload {
            id: delivery.id.clone(),
            to: delivery.to.clone(),
            seq: delivery.seq,
            return_path: delivery.from.clone(),
            category: category.to_string(),
            time: unix_time(),
            response: response.to_string(),
            fbl: delivery.fbl.clone(),
        }
    }
}

impl BounceNotifier {
    pub fn new(http: reqwest::Client, url: Option<String>) -> Self {
        BounceNotifier { http, url }
    }

    /// Posts the payload to the bounce webhook on a detached task, retrying
    /// with `retries²` seconds of back-off.
    pub fn notify(&self, payload: BouncePayload) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let body = match serde_json::to_string(&payload) {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!(
                        context = "bounce",
                        event = "webhook-encode-failed",
                        id = payload.id.as_str(),
                        reason = %err,
                    );
                    return;
                }
            };

            let mut retries = 0u32;
            loop {
                match http.post(&url).body(body.clone()).send().await {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(
                            context = "bounce",
                            event = "webhook-delivered",
                            id = payload.id.as_str(),
                            url = url.as_str(),
                        );
                        return;
                    }
                    Ok(response) => {
                        tracing::warn!(
                            context = "bounce",
                            event = "webhook-rejected",
                            id = payload.id.as_str(),
                            url = url.as_str(),
                            status = %response.status(),
                            retries = retries,
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            context = "bounce",
                            event = "webhook-failed",
                            id = payload.id.as_str(),
                            url = url.as_str(),
                            reason = %err,
                            retries = retries,
                        );
                    }
                }
                retries += 1;
                if retries > MAX_WEBHOOK_RETRIES {
                    tracing::error!(
                        context = "bounce",
                        event = "webhook-abandoned",
                        id = payload.id.as_str(),
                        url = url.as_str(),
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_secs((retries * retries) as u64)).await;
            }
        });
    }
}

/// Whether an internal bounce message may be generated for this delivery.
/// The check runs after this worker's own `Received` prepend.
pub fn may_bounce(delivery: &Delivery) -> bool {
    delivery.headers.count("Received") <= MAX_RECEIVED_HOPS
}

/// The `BOUNCE` command sent back through the queue channel when internal
/// bounces are enabled. It carries no lock; the lock was consumed by the
/// preceding `RELEASE`.
pub fn bounce_command(delivery: &Delivery, category: &str, response: &str) -> Command {
    Command::Bounce {
        id: delivery.id.clone(),
        seq: delivery.seq,
        from: delivery.from.clone(),
        to: delivery.to.clone(),
        headers: delivery.headers.clone(),
        return_path: delivery.from.clone(),
        category: category.to_string(),
        time: unix_time(),
        response: response.to_string(),
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
