/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bounce::{self, BounceAction};
use crate::core::{Core, Zone};
use crate::dkim;
use crate::fetch::BodyFetcher;
use crate::message::spam_status_value;
use crate::queue::client::{Error as QueueError, QueueClient};
use crate::queue::dsn::{bounce_command, may_bounce, BounceNotifier, BouncePayload};
use crate::queue::{Delivery, Job};

use super::session::{self, DialError, DialParams, Envelope};
use super::{lookup, Error, ErrorDetails, HostResponse};

/// Deferrals beyond this count convert into permanent rejects.
const MAX_DEFERRALS: u32 = 6;
/// Defer back-off cap, minutes.
const MAX_DEFER_TTL: u64 = 1024;
/// Empty-queue back-off cap, in 10 ms steps (10 s ceiling).
const MAX_EMPTY_BACKOFF: u32 = 1000;

/// One delivery worker: a sequential loop that pulls a locked delivery,
/// resolves, dials, sends and acknowledges. At most one delivery is in
/// flight per worker; concurrency comes from running many workers.
pub struct Worker {
    core: Arc<Core>,
    zone: Arc<Zone>,
    queue: QueueClient,
    fetcher: BodyFetcher,
    notifier: BounceNotifier,
    drain: Arc<AtomicBool>,
    empty_checks: u32,
}

/// Requests a drain: the worker finishes the in-flight delivery and exits
/// before starting another. Mid-send cancellation is deliberately not
/// supported; the queue lock must be resolved exactly once.
#[derive(Clone)]
pub struct WorkerHandle {
    drain: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn close(&self) {
        self.drain.store(true, Ordering::Relaxed);
    }
}

impl Worker {
    pub fn new(core: Arc<Core>, zone: Arc<Zone>, queue: QueueClient) -> Self {
        let fetcher = BodyFetcher::new(core.http.clone(), &core.api_hostname, core.api_port);
        let notifier = BounceNotifier::new(core.http.clone(), core.bounce_url.clone());
        Worker {
            core,
            zone,
            queue,
            fetcher,
            notifier,
            drain: Arc::new(AtomicBool::new(false)),
            empty_checks: 0,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            drain: self.drain.clone(),
        }
    }

    /// Runs until drained. A queue-channel error is fatal: the loop stops
    /// and the error is returned to the supervisor, which owns restarts.
    pub async fn run(mut self) -> Result<(), QueueError> {
        tracing::info!(
            context = "worker",
            event = "start",
            zone = self.zone.name.as_str(),
        );
        loop {
            if self.drain.load(Ordering::Relaxed) {
                tracing::info!(
                    context = "worker",
                    event = "drained",
                    zone = self.zone.name.as_str(),
                );
                return Ok(());
            }
            match self.queue.get().await? {
                Some(job) => {
                    self.empty_checks = 0;
                    self.process(job).await?;
                }
                None => {
                    self.empty_checks += 1;
                    let steps = self
                        .empty_checks
                        .saturating_mul(self.empty_checks)
                        .min(MAX_EMPTY_BACKOFF);
                    tokio::time::sleep(Duration::from_millis(steps as u64 * 10)).await;
                }
            }
        }
    }

    async fn process(&mut self, job: Job) -> Result<(), QueueError> {
        let Job { mut delivery, lock } = job;
        tracing::info!(
            context = "delivery",
            event = "accepted",
            zone = self.zone.name.as_str(),
            id = delivery.id.as_str(),
            seq = delivery.seq,
            domain = delivery.domain.as_str(),
            rcpt = ?delivery.to,
            message_id = delivery.message_id.as_str(),
        );

        self.zone.throttle().await;

        // SRS rewrites the envelope sender only; the From: header stays.
        if let Some(srs) = &self.core.srs {
            if let Some((local, domain)) = delivery.from_parts() {
                if !srs.is_excluded(domain) {
                    let rewritten = format!(
                        "{}@{}",
                        srs.rewriter.rewrite(local, domain),
                        srs.rewrite_domain
                    );
                    tracing::debug!(
                        context = "srs",
                        event = "rewrite",
                        id = delivery.id.as_str(),
                        from = delivery.from.as_str(),
                        rewritten = rewritten.as_str(),
                    );
                    delivery.from = rewritten;
                }
            }
        }

        // Spam annotation goes to the bottom of the header block.
        let spam_value = delivery
            .spam
            .as_ref()
            .and_then(|spam| spam.default.as_ref())
            .map(spam_status_value);
        if let Some(value) = spam_value {
            delivery.headers.append("X-Zone-Spam-Status", value);
        }

        // Sign with each key in reverse configuration order so the first
        // configured key ends up as the topmost DKIM-Signature.
        if self.core.dkim_enabled {
            if let Some(specs) = delivery.dkim.clone() {
                for spec in &specs {
                    for key in spec.keys.iter().rev() {
                        match dkim::sign(
                            &delivery.headers,
                            &spec.hash_algo,
                            &spec.body_hash,
                            &key.domain,
                            &key.selector,
                            &key.private_key,
                        ) {
                            Ok(value) => delivery.headers.prepend("DKIM-Signature", value),
                            Err(err) => tracing::warn!(
                                context = "dkim",
                                event = "sign-failed",
                                id = delivery.id.as_str(),
                                domain = key.domain.as_str(),
                                selector = key.selector.as_str(),
                                reason = %err,
                            ),
                        }
                    }
                }
            }
        }

        let hops_before = delivery.headers.count("Received");
        let outcome = self.attempt(&mut delivery).await;

        // No session means no trace header yet; bounce generation still
        // needs one, recorded under the system hostname.
        if delivery.headers.count("Received") == hops_before {
            let received = self.zone.received_header(&delivery, &self.core.hostname);
            delivery.headers.prepend("Received", received);
        }

        match outcome {
            Ok(response) if response.accepted() => {
                tracing::info!(
                    context = "delivery",
                    event = "delivered",
                    id = delivery.id.as_str(),
                    seq = delivery.seq,
                    mx = response.hostname.as_str(),
                    reply = %bounce::normalize(&response.text()),
                );
                self.queue
                    .release(&delivery.id, delivery.seq, &lock)
                    .await?;
            }
            outcome => {
                let (text, forced_defer) = match &outcome {
                    Ok(response) => (bounce::normalize(&response.text()), false),
                    // Verdict-free failures are transient by definition; the
                    // classifier only contributes the category.
                    Err(err) => (
                        bounce::normalize(&err.reply_text()),
                        !matches!(err, Error::NullMx(_)),
                    ),
                };
                let info = bounce::classify(&text);
                let action = if forced_defer {
                    BounceAction::Defer
                } else {
                    info.action
                };

                if action == BounceAction::Defer && delivery.deferred_count <= MAX_DEFERRALS {
                    let ttl = defer_ttl(delivery.deferred_count);
                    tracing::info!(
                        context = "delivery",
                        event = "deferred",
                        id = delivery.id.as_str(),
                        seq = delivery.seq,
                        category = info.category,
                        reply = text.as_str(),
                        ttl_ms = ttl,
                        deferred_count = delivery.deferred_count,
                    );
                    self.queue
                        .defer(&delivery.id, delivery.seq, &lock, ttl)
                        .await?;
                } else {
                    tracing::info!(
                        context = "delivery",
                        event = "rejected",
                        id = delivery.id.as_str(),
                        seq = delivery.seq,
                        category = info.category,
                        reply = text.as_str(),
                    );
                    self.queue
                        .release(&delivery.id, delivery.seq, &lock)
                        .await?;
                    self.notifier
                        .notify(BouncePayload::new(&delivery, info.category, &text));
                    if self.core.bounces_enabled {
                        if may_bounce(&delivery) {
                            self.queue
                                .bounce(bounce_command(&delivery, info.category, &text))
                                .await?;
                        } else {
                            tracing::warn!(
                                context = "bounce",
                                event = "loop-detected",
                                id = delivery.id.as_str(),
                                hops = delivery.headers.count("Received"),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve → dial fall-through over (exchange, address) pairs → send.
    /// Returns the server's verdict, or a verdict-free error after the last
    /// candidate. Once a session accepts the dial there is no fall-through:
    /// the send result is final.
    async fn attempt(&self, delivery: &mut Delivery) -> Result<HostResponse, Error> {
        let zone = &self.zone;
        let exchanges = lookup::resolve_exchanges(
            &self.core.resolver,
            zone.host.as_deref(),
            &delivery.domain,
            zone.ip_strategy,
        )
        .await?;
        let nonce = format!("{}.{}", delivery.id, delivery.seq);
        let mut last_error: Option<Error> = None;

        for mx in &exchanges {
            let ips = match lookup::ip_lookup(
                &self.core.resolver,
                mx,
                zone.ip_strategy,
                lookup::MAX_MULTIHOMED,
            )
            .await
            {
                Ok(ips) if !ips.is_empty() => ips,
                Ok(_) => {
                    tracing::info!(
                        context = "dns",
                        event = "no-addresses",
                        mx = mx.as_str(),
                    );
                    last_error = Some(Error::Connection(ErrorDetails {
                        entity: mx.clone(),
                        details: format!("No addresses found for {mx}"),
                    }));
                    continue;
                }
                Err(err) => {
                    tracing::info!(
                        context = "dns",
                        event = "ip-lookup-failed",
                        mx = mx.as_str(),
                        reason = %err,
                    );
                    last_error = Some(err);
                    continue;
                }
            };

            'next_ip: for ip in ips {
                let source = zone.source_address(&nonce, ip.is_ipv6());
                let source_ip = source.map(|address| address.ip);
                let local_name = source
                    .map(|address| address.name.clone())
                    .unwrap_or_else(|| self.core.hostname.clone());

                let started = Instant::now();
                let mut allow_starttls = !zone.secure && !zone.starttls_disabled();
                let dialed = loop {
                    let result = session::dial(DialParams {
                        hostname: mx,
                        ip,
                        port: zone.port,
                        source_ip,
                        local_name: &local_name,
                        secure: zone.secure,
                        allow_starttls,
                        require_tls: zone.require_tls,
                        credentials: zone.credentials.as_ref(),
                        connector: &self.core.connector,
                        log_transcript: zone.log_mx,
                    })
                    .await;
                    match result {
                        Ok(session) => break Ok(session),
                        Err(DialError::StartTls(err)) if allow_starttls => {
                            // The upgrade broke mid-handshake: remember that
                            // for the whole zone and retry this address once
                            // in plaintext.
                            zone.set_starttls_disabled();
                            allow_starttls = false;
                            tracing::info!(
                                context = "tls",
                                event = "starttls-downgrade",
                                zone = zone.name.as_str(),
                                mx = mx.as_str(),
                                ip = %ip,
                                reason = %err,
                            );
                        }
                        Err(DialError::StartTls(err)) | Err(DialError::Other(err)) => {
                            break Err(err)
                        }
                    }
                };
                self.core.timers.record("Delivery:dial", started.elapsed());

                let mut session = match dialed {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::info!(
                            context = "connect",
                            event = "failed",
                            mx = mx.as_str(),
                            ip = %ip,
                            reason = %err,
                        );
                        last_error = Some(err);
                        continue 'next_ip;
                    }
                };
                tracing::debug!(
                    context = "connect",
                    event = "success",
                    mx = mx.as_str(),
                    ip = %ip,
                    tls = session.is_tls(),
                    local_name = session.local_name(),
                );

                // The trace header records the HELO name actually used; from
                // the first byte on the wire the block is frozen.
                let received = zone.received_header(delivery, session.local_name());
                delivery.headers.insert(0, "Received", received);
                let size = delivery.headers.wire_len() + delivery.body_size;

                let mut body = match self.fetcher.fetch(&delivery.id).await {
                    Ok(body) => body,
                    Err(err) => {
                        session.close().await;
                        return Err(Error::Fetch(ErrorDetails {
                            entity: delivery.id.clone(),
                            details: err.to_string(),
                        }));
                    }
                };

                let headers = delivery.headers.to_wire();
                let envelope = Envelope {
                    from: &delivery.from,
                    to: &delivery.to,
                    size,
                };
                let started = Instant::now();
                let result = session.send(&envelope, &headers, &mut body).await;
                session.close().await;
                self.core.timers.record("Delivery:send", started.elapsed());
                return result;
            }
        }

        if let Some(err) = last_error {
            tracing::info!(
                context = "delivery",
                event = "exhausted",
                domain = delivery.domain.as_str(),
                last_error = %err,
            );
        }
        Err(Error::unreachable(&delivery.domain))
    }
}

fn defer_ttl(deferred_count: u32) -> u64 {
    5u64.saturating_pow(deferred_count + 1).min(MAX_DEFER_TTL) * 60 * 1000
}
