/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mail_auth::{IpLookupStrategy, Resolver};
use mail_send::Credentials;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ServerName};
use tokio_rustls::TlsConnector;

use crate::config::{Config, ZoneConfig};
use crate::message::{render_received, DEFAULT_RECEIVED_TEMPLATE};
use crate::queue::Delivery;
use crate::srs::SrsRewriter;
use crate::timers::TimerRegistry;

use self::throttle::Speedometer;

pub mod throttle;

/// State shared by every worker: configuration compiled into runtime form,
/// the DNS resolver, the timer registry and the TLS/HTTP clients.
pub struct Core {
    pub resolver: Resolver,
    pub timers: Arc<TimerRegistry>,
    pub connector: TlsConnector,
    pub http: reqwest::Client,
    pub zones: Vec<Arc<Zone>>,
    pub hostname: String,
    pub api_hostname: String,
    pub api_port: u16,
    pub queue_addr: String,
    pub queue_timeout: Duration,
    pub dkim_enabled: bool,
    pub srs: Option<Srs>,
    pub bounce_url: Option<String>,
    pub bounces_enabled: bool,
    pub timers_flush_interval: Duration,
}

pub struct Srs {
    pub rewriter: SrsRewriter,
    pub rewrite_domain: String,
    exclude_domains: Vec<String>,
}

impl Srs {
    pub fn is_excluded(&self, domain: &str) -> bool {
        self.exclude_domains
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(domain))
    }
}

#[derive(Debug, Clone)]
pub struct PoolAddress {
    pub ip: IpAddr,
    pub name: String,
}

/// A named egress policy, shared read-mostly by all workers of the zone.
/// `disable_starttls` is the only mutable field: it is a cross-worker hint
/// flipped when a server breaks during the TLS upgrade, and last-write-wins
/// is acceptable.
pub struct Zone {
    pub name: String,
    pub host: Option<String>,
    pub port: u16,
    pub secure: bool,
    pub require_tls: bool,
    disable_starttls: AtomicBool,
    pub credentials: Option<Credentials<String>>,
    pub pool: Vec<PoolAddress>,
    pub ip_strategy: IpLookupStrategy,
    speedometer: Option<Speedometer>,
    pub received_template: String,
    pub log_mx: bool,
    pub workers: usize,
}

impl Zone {
    pub fn starttls_disabled(&self) -> bool {
        self.disable_starttls.load(Ordering::Relaxed)
    }

    pub fn set_starttls_disabled(&self) {
        self.disable_starttls.store(true, Ordering::Relaxed);
    }

    /// Picks a stable pool address for a delivery nonce. Consistent hashing
    /// keeps the source IP stable across retries of the same `id.seq`.
    pub fn source_address(&self, nonce: &str, ipv6: bool) -> Option<&PoolAddress> {
        let matching = self
            .pool
            .iter()
            .filter(|address| address.ip.is_ipv6() == ipv6)
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        nonce.hash(&mut hasher);
        Some(matching[(hasher.finish() % matching.len() as u64) as usize])
    }

    pub fn received_header(&self, delivery: &Delivery, helo: &str) -> String {
        render_received(&self.received_template, delivery, helo, &self.name)
    }

    /// Waits on the zone speedometer, when one is configured.
    pub async fn throttle(&self) {
        if let Some(speedometer) = &self.speedometer {
            speedometer.acquire().await;
        }
    }
}

impl Core {
    pub fn new(config: Config) -> Result<Self, String> {
        let resolver = match config.resolver.kind.as_str() {
            "system" => Resolver::new_system_conf(),
            "cloudflare" => Resolver::new_cloudflare(),
            "google" => Resolver::new_google(),
            "quad9" => Resolver::new_quad9(),
            other => return Err(format!("Unknown resolver type {other:?}")),
        }
        .map_err(|err| format!("Failed to build DNS resolver: {err}"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {err}"))?;

        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut zones = Vec::with_capacity(config.zones.len());
        for zone in config.zones {
            zones.push(Arc::new(build_zone(zone, config.log.mx)?));
        }

        let srs = if config.srs.enabled {
            if config.srs.rewrite_domain.is_empty() {
                return Err("srs.rewrite-domain is required when SRS is enabled".to_string());
            }
            Some(Srs {
                rewriter: SrsRewriter::new(config.srs.secret.as_bytes().to_vec()),
                rewrite_domain: config.srs.rewrite_domain,
                exclude_domains: config.srs.exclude_domains,
            })
        } else {
            None
        };

        Ok(Core {
            resolver,
            timers: Arc::new(TimerRegistry::default()),
            connector: opportunistic_connector(),
            http,
            zones,
            hostname,
            api_hostname: config.api.hostname,
            api_port: config.api.port,
            queue_addr: format!("{}:{}", config.queue.hostname, config.queue.port),
            queue_timeout: Duration::from_secs(config.queue.timeout),
            dkim_enabled: config.dkim.enabled,
            srs,
            bounce_url: config.bounces.url,
            bounces_enabled: config.bounces.enabled,
            timers_flush_interval: Duration::from_secs(config.timers.flush_interval),
        })
    }

    pub fn zone(&self, name: &str) -> Option<&Arc<Zone>> {
        self.zones.iter().find(|zone| zone.name == name)
    }
}

fn build_zone(config: ZoneConfig, default_log_mx: bool) -> Result<Zone, String> {
    if config.name.is_empty() {
        return Err("Every zone needs a name".to_string());
    }
    let ip_strategy = match config.ip_strategy.as_str() {
        "ipv4" => IpLookupStrategy::Ipv4Only,
        "ipv6" => IpLookupStrategy::Ipv6Only,
        "ipv4-then-ipv6" => IpLookupStrategy::Ipv4thenIpv6,
        "ipv6-then-ipv4" => IpLookupStrategy::Ipv6thenIpv4,
        other => {
            return Err(format!(
                "Unknown ip-strategy {other:?} in zone {:?}",
                config.name
            ))
        }
    };

    Ok(Zone {
        workers: config.workers.unwrap_or_else(|| config.addresses.len().max(1)),
        credentials: config
            .auth
            .map(|auth| Credentials::new(auth.username, auth.secret)),
        speedometer: config.throttle.map(|throttle| {
            Speedometer::new(throttle.messages, Duration::from_secs(throttle.interval))
        }),
        pool: config
            .addresses
            .into_iter()
            .map(|address| PoolAddress {
                ip: address.ip,
                name: address.name,
            })
            .collect(),
        received_template: config
            .received_template
            .unwrap_or_else(|| DEFAULT_RECEIVED_TEMPLATE.to_string()),
        log_mx: config.log_mx.unwrap_or(default_log_mx),
        name: config.name,
        host: config.host,
        port: config.port,
        secure: config.secure,
        require_tls: config.require_tls,
        disable_starttls: AtomicBool::new(config.disable_starttls),
        ip_strategy,
    })
}

/// TLS for outbound sessions is opportunistic by design: it encrypts when the
/// server offers it but never validates the certificate chain.
fn opportunistic_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(DummyVerifier))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

struct DummyVerifier;

impl ServerCertVerifier for DummyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
