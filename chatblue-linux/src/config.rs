//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chatblue_core::service_identity_or_default;
use chatblue_link::LinkConfig;
use serde::Deserialize;
use uuid::Uuid;

use crate::transport::DialPolicy;

/// Daemon configuration. File: ~/.config/chatblue/config.toml or /etc/chatblue/config.toml.
/// Env overrides: CHATBLUE_NAME, CHATBLUE_SERVICE_UUID, CHATBLUE_DISCOVERY_PORT,
/// CHATBLUE_TRANSPORT_PORT, CHATBLUE_SCAN_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name advertised in beacons.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Service identity; blank or malformed falls back to the built-in UUID.
    #[serde(default)]
    pub service_uuid: Option<String>,
    /// Discovery UDP port (default 45688).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 8988).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Scan window before discovery reports finished.
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
    /// Backoff between dials, multiplied by the attempt number.
    #[serde(default = "default_dial_backoff_ms")]
    pub dial_backoff_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_owner_accept_timeout_secs")]
    pub owner_accept_timeout_secs: u64,
    #[serde(default = "default_retry_settle_ms")]
    pub retry_settle_ms: u64,
    #[serde(default = "default_max_frame_mib")]
    pub max_frame_mib: u32,
}

fn default_discovery_port() -> u16 {
    45688
}
fn default_transport_port() -> u16 {
    8988
}
fn default_scan_secs() -> u64 {
    12
}
fn default_dial_attempts() -> u32 {
    5
}
fn default_dial_backoff_ms() -> u64 {
    700
}
fn default_dial_timeout_ms() -> u64 {
    8000
}
fn default_owner_accept_timeout_secs() -> u64 {
    30
}
fn default_retry_settle_ms() -> u64 {
    1500
}
fn default_max_frame_mib() -> u32 {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            service_uuid: None,
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            scan_secs: default_scan_secs(),
            dial_attempts: default_dial_attempts(),
            dial_backoff_ms: default_dial_backoff_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            owner_accept_timeout_secs: default_owner_accept_timeout_secs(),
            retry_settle_ms: default_retry_settle_ms(),
            max_frame_mib: default_max_frame_mib(),
        }
    }
}

impl Config {
    pub fn service_identity(&self) -> Uuid {
        service_identity_or_default(self.service_uuid.as_deref())
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            service_uuid: self.service_identity(),
            retry_settle_delay: Duration::from_millis(self.retry_settle_ms),
            max_frame_len: self.max_frame_mib.saturating_mul(1024 * 1024),
            ..LinkConfig::default()
        }
    }

    pub fn dial_policy(&self) -> DialPolicy {
        DialPolicy {
            attempts: self.dial_attempts.max(1),
            backoff: Duration::from_millis(self.dial_backoff_ms),
            timeout: Duration::from_millis(self.dial_timeout_ms),
            owner_accept_timeout: Duration::from_secs(self.owner_accept_timeout_secs),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("CHATBLUE_NAME") {
            self.display_name = Some(s);
        }
        if let Some(s) = var("CHATBLUE_SERVICE_UUID") {
            self.service_uuid = Some(s);
        }
        if let Some(p) = var("CHATBLUE_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("CHATBLUE_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(n) = var("CHATBLUE_SCAN_SECS").and_then(|s| s.parse().ok()) {
            self.scan_secs = n;
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match find_file() {
        Some(path) => {
            let s = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            parse(&s).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chatblue/config.toml"));
    }
    out.push(PathBuf::from("/etc/chatblue/config.toml"));
    out
}

fn find_file() -> Option<PathBuf> {
    config_paths().into_iter().find(|p| p.exists())
}
