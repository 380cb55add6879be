//! Layered TOML configuration for the sockbridge bridge.
//!
//! Loads from:
//! - Global config: `~/.config/sockbridge/sockbridge.toml`
//! - Project config: `<workspace>/.sockbridge/sockbridge.toml`
//! - An explicit file passed with `--config`
//!
//! Every scalar is optional; a later layer wins when it sets a value.
//! Unset values fall back to the bridge defaults in
//! [`to_bridge_config`](BridgeSettings::to_bridge_config).
//!
//! # Example
//!
//! ```no_run
//! use sockbridge_settings::ConfigLoader;
//!
//! let settings = ConfigLoader::load(std::path::Path::new("."));
//! let config = settings.to_bridge_config().unwrap();
//! println!("{}", config.listen_addr);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use sockbridge_core::{BackoffPolicy, BridgeConfig, HeartbeatConfig, TrustPolicy};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Lowest listen port accepted; privileged ports are refused.
pub const MIN_LISTEN_PORT: u16 = 1024;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value parsed but is out of range.
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SettingsError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// TOML `[listener]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Bind address, e.g. `0.0.0.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,

    /// Bind port. Must be at least 1024.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Certificate fingerprint advertised to pairing clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// TOML `[upstream]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// HTTP debugging proxy host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// HTTP debugging proxy port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Per-attempt TCP connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

/// TOML `[limits]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,

    /// Closed sessions remembered for statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,

    /// Relay buffer size (bytes) at which reading pauses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_high_watermark: Option<usize>,

    /// Relay buffer size (bytes) below which reading resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_low_watermark: Option<usize>,
}

/// TOML `[heartbeat]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_interval_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_interval_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_spacing_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,

    /// Client-side deadline without probes before the bridge is presumed gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_timeout_secs: Option<u64>,
}

/// TOML `[backoff]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Relative jitter, e.g. `0.2` for ±20%.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

/// TOML `[trust]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustSettings {
    /// Accept loopback sources in addition to private/link-local ranges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_loopback: Option<bool>,
}

/// Top-level configuration, corresponding to `sockbridge.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub listener: ListenerSettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub limits: LimitsSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub trust: TrustSettings,
}

/// Replace `base` with `other` when `other` is set.
fn overlay<T>(base: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *base = other;
    }
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

impl BridgeSettings {
    /// Parse settings from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or a
    /// value has the wrong type.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load settings from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize these settings to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save these settings to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (the later layer) on top of `self`.
    ///
    /// Every field is scalar: `other` wins when it is set.
    #[must_use]
    pub fn merge(mut self, other: BridgeSettings) -> BridgeSettings {
        let l = other.listener;
        overlay(&mut self.listener.address, l.address);
        overlay(&mut self.listener.port, l.port);
        overlay(&mut self.listener.fingerprint, l.fingerprint);

        let u = other.upstream;
        overlay(&mut self.upstream.host, u.host);
        overlay(&mut self.upstream.port, u.port);
        overlay(&mut self.upstream.connect_timeout_secs, u.connect_timeout_secs);

        let m = other.limits;
        overlay(&mut self.limits.max_connections, m.max_connections);
        overlay(&mut self.limits.idle_timeout_secs, m.idle_timeout_secs);
        overlay(&mut self.limits.handshake_timeout_secs, m.handshake_timeout_secs);
        overlay(&mut self.limits.history_limit, m.history_limit);
        overlay(&mut self.limits.flow_high_watermark, m.flow_high_watermark);
        overlay(&mut self.limits.flow_low_watermark, m.flow_low_watermark);

        let h = other.heartbeat;
        overlay(&mut self.heartbeat.enabled, h.enabled);
        overlay(&mut self.heartbeat.active_interval_secs, h.active_interval_secs);
        overlay(&mut self.heartbeat.background_interval_secs, h.background_interval_secs);
        overlay(&mut self.heartbeat.ack_timeout_secs, h.ack_timeout_secs);
        overlay(&mut self.heartbeat.retry_spacing_secs, h.retry_spacing_secs);
        overlay(&mut self.heartbeat.max_failures, h.max_failures);
        overlay(&mut self.heartbeat.liveness_timeout_secs, h.liveness_timeout_secs);

        let b = other.backoff;
        overlay(&mut self.backoff.base_ms, b.base_ms);
        overlay(&mut self.backoff.factor, b.factor);
        overlay(&mut self.backoff.max_attempts, b.max_attempts);
        overlay(&mut self.backoff.jitter, b.jitter);

        overlay(&mut self.trust.allow_loopback, other.trust.allow_loopback);
        self
    }

    /// Fully populated settings describing `config`.
    ///
    /// Used by `config init` for a starter file and by `config show` to
    /// print the effective configuration.
    pub fn from_bridge_config(config: &BridgeConfig) -> Self {
        Self {
            listener: ListenerSettings {
                address: Some(config.listen_addr.ip()),
                port: Some(config.listen_addr.port()),
                fingerprint: config.fingerprint.clone(),
            },
            upstream: UpstreamSettings {
                host: Some(config.upstream_host.clone()),
                port: Some(config.upstream_port),
                connect_timeout_secs: Some(config.upstream_connect_timeout.as_secs()),
            },
            limits: LimitsSettings {
                max_connections: Some(config.max_connections),
                idle_timeout_secs: Some(config.idle_timeout.as_secs()),
                handshake_timeout_secs: Some(config.handshake_timeout.as_secs()),
                history_limit: Some(config.history_limit),
                flow_high_watermark: Some(config.flow_high_watermark),
                flow_low_watermark: Some(config.flow_low_watermark),
            },
            heartbeat: HeartbeatSettings {
                enabled: Some(config.heartbeat.enabled),
                active_interval_secs: Some(config.heartbeat.active_interval.as_secs()),
                background_interval_secs: Some(config.heartbeat.background_interval.as_secs()),
                ack_timeout_secs: Some(config.heartbeat.ack_timeout.as_secs()),
                retry_spacing_secs: Some(config.heartbeat.retry_spacing.as_secs()),
                max_failures: Some(config.heartbeat.max_failures),
                liveness_timeout_secs: Some(config.heartbeat.liveness_timeout.as_secs()),
            },
            backoff: BackoffSettings {
                base_ms: Some(config.backoff.base.as_millis() as u64),
                factor: Some(config.backoff.factor),
                max_attempts: Some(config.backoff.max_attempts),
                jitter: Some(config.backoff.jitter),
            },
            trust: TrustSettings {
                allow_loopback: Some(config.trust.allow_loopback),
            },
        }
    }

    /// Build the bridge configuration, filling unset values with defaults.
    ///
    /// # Errors
    /// Returns `SettingsError::Invalid` if the result fails
    /// [`validate`](Self::validate).
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, SettingsError> {
        let d = BridgeConfig::default();
        let hb = &d.heartbeat;
        let bo = &d.backoff;

        let config = BridgeConfig {
            listen_addr: SocketAddr::new(
                self.listener.address.unwrap_or(d.listen_addr.ip()),
                self.listener.port.unwrap_or(d.listen_addr.port()),
            ),
            upstream_host: self
                .upstream
                .host
                .clone()
                .unwrap_or_else(|| d.upstream_host.clone()),
            upstream_port: self.upstream.port.unwrap_or(d.upstream_port),
            max_connections: self.limits.max_connections.unwrap_or(d.max_connections),
            idle_timeout: secs(self.limits.idle_timeout_secs, d.idle_timeout),
            handshake_timeout: secs(self.limits.handshake_timeout_secs, d.handshake_timeout),
            upstream_connect_timeout: secs(
                self.upstream.connect_timeout_secs,
                d.upstream_connect_timeout,
            ),
            heartbeat: HeartbeatConfig {
                enabled: self.heartbeat.enabled.unwrap_or(hb.enabled),
                active_interval: secs(self.heartbeat.active_interval_secs, hb.active_interval),
                background_interval: secs(
                    self.heartbeat.background_interval_secs,
                    hb.background_interval,
                ),
                ack_timeout: secs(self.heartbeat.ack_timeout_secs, hb.ack_timeout),
                retry_spacing: secs(self.heartbeat.retry_spacing_secs, hb.retry_spacing),
                max_failures: self.heartbeat.max_failures.unwrap_or(hb.max_failures),
                liveness_timeout: secs(self.heartbeat.liveness_timeout_secs, hb.liveness_timeout),
            },
            backoff: BackoffPolicy {
                base: self
                    .backoff
                    .base_ms
                    .map(Duration::from_millis)
                    .unwrap_or(bo.base),
                factor: self.backoff.factor.unwrap_or(bo.factor),
                max_attempts: self.backoff.max_attempts.unwrap_or(bo.max_attempts),
                jitter: self.backoff.jitter.unwrap_or(bo.jitter),
            },
            flow_high_watermark: self
                .limits
                .flow_high_watermark
                .unwrap_or(d.flow_high_watermark),
            flow_low_watermark: self
                .limits
                .flow_low_watermark
                .unwrap_or(d.flow_low_watermark),
            trust: TrustPolicy {
                allow_loopback: self.trust.allow_loopback.unwrap_or(d.trust.allow_loopback),
            },
            history_limit: self.limits.history_limit.unwrap_or(d.history_limit),
            fingerprint: self.listener.fingerprint.clone().or(d.fingerprint),
        };

        validate_config(&config)?;
        Ok(config)
    }

    /// Check that the effective configuration is usable.
    ///
    /// # Errors
    /// Returns `SettingsError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.to_bridge_config().map(|_| ())
    }
}

fn validate_config(config: &BridgeConfig) -> Result<(), SettingsError> {
    if config.listen_addr.port() < MIN_LISTEN_PORT {
        return Err(SettingsError::invalid(
            "listener.port",
            format!(
                "{} is below {MIN_LISTEN_PORT}; privileged ports are not allowed",
                config.listen_addr.port()
            ),
        ));
    }
    if config.upstream_host.trim().is_empty() {
        return Err(SettingsError::invalid("upstream.host", "must not be empty"));
    }
    if config.upstream_port == 0 {
        return Err(SettingsError::invalid("upstream.port", "must not be 0"));
    }
    if config.max_connections == 0 {
        return Err(SettingsError::invalid(
            "limits.max_connections",
            "must be at least 1",
        ));
    }
    if config.idle_timeout.is_zero() {
        return Err(SettingsError::invalid(
            "limits.idle_timeout_secs",
            "must be at least 1",
        ));
    }
    if config.flow_low_watermark >= config.flow_high_watermark {
        return Err(SettingsError::invalid(
            "limits.flow_low_watermark",
            format!(
                "{} must be below flow_high_watermark ({})",
                config.flow_low_watermark, config.flow_high_watermark
            ),
        ));
    }
    if config.backoff.max_attempts == 0 {
        return Err(SettingsError::invalid(
            "backoff.max_attempts",
            "must be at least 1",
        ));
    }
    if config.backoff.factor == 0 {
        return Err(SettingsError::invalid("backoff.factor", "must be at least 1"));
    }
    if !(0.0..1.0).contains(&config.backoff.jitter) {
        return Err(SettingsError::invalid(
            "backoff.jitter",
            format!("{} is outside [0, 1)", config.backoff.jitter),
        ));
    }
    let hb = &config.heartbeat;
    if hb.enabled {
        if hb.active_interval.is_zero() || hb.background_interval.is_zero() {
            return Err(SettingsError::invalid(
                "heartbeat.active_interval_secs",
                "heartbeat intervals must be at least 1 second",
            ));
        }
        if hb.max_failures == 0 {
            return Err(SettingsError::invalid(
                "heartbeat.max_failures",
                "must be at least 1",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn test_parse_empty_config() {
        let settings = BridgeSettings::parse("").unwrap();
        assert_eq!(settings, BridgeSettings::default());
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
[listener]
address = "127.0.0.1"
port = 9100

[upstream]
host = "10.0.0.5"
port = 8080

[limits]
max_connections = 20

[heartbeat]
enabled = false

[backoff]
base_ms = 500
jitter = 0.1

[trust]
allow_loopback = false
"#;
        let settings = BridgeSettings::parse(toml).unwrap();
        assert_eq!(settings.listener.address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(settings.listener.port, Some(9100));
        assert_eq!(settings.upstream.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(settings.limits.max_connections, Some(20));
        assert_eq!(settings.heartbeat.enabled, Some(false));
        assert_eq!(settings.backoff.base_ms, Some(500));
        assert_eq!(settings.trust.allow_loopback, Some(false));
    }

    #[test]
    fn test_parse_wrong_type_fails() {
        let err = BridgeSettings::parse("[listener]\nport = \"nine\"").unwrap_err();
        assert!(matches!(err, SettingsError::ParseError(_)));
        assert!(!err.to_string().is_empty());
    }

    // ========================================================================
    // Merging
    // ========================================================================

    #[test]
    fn test_merge_later_layer_wins() {
        let global = BridgeSettings::parse("[listener]\nport = 9100\n[upstream]\nport = 8080").unwrap();
        let project = BridgeSettings::parse("[listener]\nport = 9200").unwrap();
        let merged = global.merge(project);
        assert_eq!(merged.listener.port, Some(9200));
        assert_eq!(merged.upstream.port, Some(8080));
    }

    #[test]
    fn test_merge_keeps_earlier_when_later_unset() {
        let global = BridgeSettings::parse("[heartbeat]\nenabled = false").unwrap();
        let merged = global.merge(BridgeSettings::default());
        assert_eq!(merged.heartbeat.enabled, Some(false));
    }

    // ========================================================================
    // Conversion and Validation
    // ========================================================================

    #[test]
    fn test_defaults_produce_default_bridge_config() {
        let config = BridgeSettings::default().to_bridge_config().unwrap();
        let expected = BridgeConfig::default();
        assert_eq!(config.listen_addr, expected.listen_addr);
        assert_eq!(config.upstream_host, "localhost");
        assert_eq!(config.upstream_port, 8888);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.heartbeat, expected.heartbeat);
        assert_eq!(config.backoff, expected.backoff);
        assert_eq!(config.flow_high_watermark, 64 * 1024);
        assert_eq!(config.flow_low_watermark, 32 * 1024);
    }

    #[test]
    fn test_to_bridge_config_applies_values() {
        let settings = BridgeSettings::parse(
            "[upstream]\nhost = \"proxy.lan\"\nport = 9090\n[limits]\nidle_timeout_secs = 120\n[backoff]\nbase_ms = 250",
        )
        .unwrap();
        let config = settings.to_bridge_config().unwrap();
        assert_eq!(config.upstream_authority(), "proxy.lan:9090");
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.backoff.base, Duration::from_millis(250));
    }

    #[test]
    fn test_privileged_port_rejected() {
        let settings = BridgeSettings::parse("[listener]\nport = 80").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid { field: "listener.port", .. }
        ));
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let settings = BridgeSettings::parse("[limits]\nmax_connections = 0").unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { field: "limits.max_connections", .. })
        ));
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let settings = BridgeSettings::parse(
            "[limits]\nflow_high_watermark = 1024\nflow_low_watermark = 2048",
        )
        .unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { field: "limits.flow_low_watermark", .. })
        ));
    }

    #[test]
    fn test_empty_upstream_host_rejected() {
        let settings = BridgeSettings::parse("[upstream]\nhost = \"  \"").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_jitter_out_of_range_rejected() {
        let settings = BridgeSettings::parse("[backoff]\njitter = 1.5").unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { field: "backoff.jitter", .. })
        ));
    }

    #[test]
    fn test_zero_backoff_attempts_rejected() {
        let settings = BridgeSettings::parse("[backoff]\nmax_attempts = 0").unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { field: "backoff.max_attempts", .. })
        ));
    }

    #[test]
    fn test_from_bridge_config_round_trips_through_toml() {
        let starter = BridgeSettings::from_bridge_config(&BridgeConfig::default());
        let reparsed = BridgeSettings::parse(&starter.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed, starter);
        assert_eq!(reparsed.listener.port, Some(9000));
        assert_eq!(reparsed.backoff.max_attempts, Some(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sockbridge.toml");

        let mut settings = BridgeSettings::default();
        settings.upstream.host = Some("10.1.2.3".to_string());
        settings.save(&path).unwrap();

        let loaded = BridgeSettings::load(&path).unwrap();
        assert_eq!(loaded.upstream.host.as_deref(), Some("10.1.2.3"));
    }
}
