//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// rumqttc panics on keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub relay: RelaySettings,
}

/// Where the broker is and who we are to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_sec: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4222,
            username: String::new(),
            password: String::new(),
            client_id: "telemetry-relay".to_string(),
            keep_alive_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Single channel used for requests and replies alike.
    pub channel: String,
    /// Outer bound on one connect attempt, enforced by the supervisor.
    pub connect_timeout_sec: u64,
    /// TCP/handshake timeout handed to the transport itself.
    pub transport_timeout_sec: u64,
    pub retry_interval_sec: u64,
    pub outbound_queue: usize,
    pub logs_dir: PathBuf,
    /// Re-broadcast `reportMeasurements` this often; 0 = only on connect.
    pub report_interval_sec: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            channel: "nats_dialog".to_string(),
            connect_timeout_sec: 3,
            transport_timeout_sec: 5,
            retry_interval_sec: 5,
            outbound_queue: 64,
            logs_dir: PathBuf::from("logs"),
            report_interval_sec: 0,
        }
    }
}

impl RelaySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_sec)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_sec)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_sec > 0).then(|| Duration::from_secs(self.report_interval_sec))
    }
}

impl Config {
    /// Defaults with the given broker address and credentials.
    pub fn for_broker(host: &str, username: &str, password: &str) -> Self {
        Self {
            broker: BrokerConfig {
                host: host.to_string(),
                username: username.to_string(),
                password: password.to_string(),
                ..BrokerConfig::default()
            },
            relay: RelaySettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);
        self.validate_relay(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        let b = &self.broker;

        if b.host.trim().is_empty() {
            errors.push("broker.host is empty".to_string());
        }
        if b.port == 0 {
            errors.push("broker.port must be non-zero".to_string());
        }
        if b.client_id.trim().is_empty() {
            errors.push("broker.client_id is empty".to_string());
        }
        if b.keep_alive_sec < MIN_KEEP_ALIVE_SEC {
            errors.push(format!(
                "broker.keep_alive_sec must be at least {MIN_KEEP_ALIVE_SEC}, got {}",
                b.keep_alive_sec
            ));
        }
        if b.username.is_empty() && !b.password.is_empty() {
            errors.push("broker.password is set but broker.username is empty".to_string());
        }
    }

    fn validate_relay(&self, errors: &mut Vec<String>) {
        let r = &self.relay;

        // ── Channel ─────────────────────────────────────────
        if r.channel.trim().is_empty() {
            errors.push("relay.channel is empty".to_string());
        } else if r.channel.contains(['+', '#']) {
            errors.push(format!(
                "relay.channel '{}' must not contain wildcards",
                r.channel
            ));
        }

        // ── Timing values (all must be positive) ────────────
        for (name, value) in [
            ("connect_timeout_sec", r.connect_timeout_sec),
            ("transport_timeout_sec", r.transport_timeout_sec),
            ("retry_interval_sec", r.retry_interval_sec),
        ] {
            if value == 0 {
                errors.push(format!("relay.{name} must be positive, got 0"));
            }
        }

        if r.outbound_queue == 0 {
            errors.push("relay.outbound_queue must be positive, got 0".to_string());
        }
        if r.logs_dir.as_os_str().is_empty() {
            errors.push("relay.logs_dir is empty".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string (no validation).
pub fn parse(contents: &str) -> Result<Config> {
    toml::from_str(contents).context("failed to parse config")
}

/// Read the config file at `path` if it exists (defaults otherwise), apply
/// environment overrides, and validate the result.
pub fn load(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        parse(&contents).with_context(|| format!("invalid config file: {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };

    apply_env(&mut config, |key| std::env::var(key).ok())?;

    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

/// Override broker settings from `RELAY_HOST`, `RELAY_PORT`,
/// `RELAY_USERNAME` and `RELAY_PASSWORD`.
pub fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(host) = var("RELAY_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = var("RELAY_PORT") {
        config.broker.port = port
            .parse()
            .with_context(|| format!("RELAY_PORT is not a valid port: {port}"))?;
    }
    if let Some(username) = var("RELAY_USERNAME") {
        config.broker.username = username;
    }
    if let Some(password) = var("RELAY_PASSWORD") {
        config.broker.password = password;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
