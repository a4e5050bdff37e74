/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub dkim: DkimConfig,
    pub srs: SrsConfig,
    pub bounces: BouncesConfig,
    pub log: LogConfig,
    pub resolver: ResolverConfig,
    pub timers: TimersConfig,
    #[serde(rename = "zone")]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ApiConfig {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct QueueConfig {
    pub hostname: String,
    pub port: u16,
    /// Per-command timeout, seconds.
    pub timeout: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct DkimConfig {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SrsConfig {
    pub enabled: bool,
    pub rewrite_domain: String,
    pub exclude_domains: Vec<String>,
    pub secret: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BouncesConfig {
    pub url: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct LogConfig {
    pub level: String,
    /// Default SMTP transcript logging for all zones.
    pub mx: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ResolverConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct TimersConfig {
    /// Seconds between registry flushes.
    pub flush_interval: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ZoneConfig {
    pub name: String,
    /// Forced next hop; bypasses MX resolution when set.
    pub host: Option<String>,
    pub port: u16,
    /// Implicit TLS on connect.
    pub secure: bool,
    pub disable_starttls: bool,
    pub require_tls: bool,
    pub ip_strategy: String,
    pub workers: Option<usize>,
    pub auth: Option<AuthConfig>,
    pub throttle: Option<ThrottleConfig>,
    pub received_template: Option<String>,
    /// Per-zone SMTP transcript logging override.
    pub log_mx: Option<bool>,
    #[serde(rename = "address")]
    pub addresses: Vec<AddressConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AuthConfig {
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ThrottleConfig {
    pub messages: u64,
    /// Window length, seconds.
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AddressConfig {
    pub ip: IpAddr,
    pub name: String,
}

impl Config {
    pub fn parse(toml: &str) -> Result<Self, String> {
        toml::from_str(toml).map_err(|err| format!("Invalid configuration: {err}"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| format!("Failed to read {}: {err}", path.display()))?;
        Self::parse(&contents)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            hostname: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            hostname: "127.0.0.1".to_string(),
            port: 5787,
            timeout: 60,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            mx: false,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            kind: "system".to_string(),
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        TimersConfig { flush_interval: 60 }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            name: String::new(),
            host: None,
            port: 25,
            secure: false,
            disable_starttls: false,
            require_tls: false,
            ip_strategy: "ipv4-then-ipv6".to_string(),
            workers: None,
            auth: None,
            throttle: None,
            received_template: None,
            log_mx: None,
            addresses: Vec::new(),
        }
    }
}
