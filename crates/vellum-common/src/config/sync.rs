//! Sync client and session configuration.
//!
//! Client configuration can be loaded from TOML:
//!
//! ```rust
//! use vellum_common::config::{StopPolicy, SyncClientConfig};
//!
//! let config = SyncClientConfig::from_toml_str(
//!     r#"
//!     server_url = "wss://sync.example.com/api"
//!     resumption_delay_interval_ms = 500
//!     stop_policy = "immediately"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.resumption_delay_interval_ms, 500);
//! assert_eq!(config.stop_policy, StopPolicy::Immediately);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_DELAY_JITTER_DIVISOR, DEFAULT_FAST_RECONNECT_LIMIT_MS, DEFAULT_MAX_RESUMPTION_DELAY_MS,
    DEFAULT_RESUMPTION_BACKOFF_MULTIPLIER, DEFAULT_RESUMPTION_DELAY_MS,
};

/// What a session does with pending uploads when it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Tear down at once.
    Immediately,
    /// Never tear down while the process lives.
    LiveIndefinitely,
    /// Keep running until every local change has been uploaded.
    #[default]
    AfterChangesUploaded,
}

/// How a client reset requested by the server is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientResyncMode {
    /// Surface the error; the application performs the reset.
    Manual,
    /// Replace local state with the fresh copy, dropping unsynced changes.
    DiscardLocal,
    /// Replay unsynced changes on top of the fresh copy.
    Recover,
    /// Try `Recover`, fall back to `DiscardLocal`.
    #[default]
    RecoverOrDiscard,
}

/// Synchronization protocol flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Partition-based sync.
    #[default]
    Pbs,
    /// Flexible (subscription-based) sync.
    Flx,
}

/// Sync client configuration, shared by every session of a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncClientConfig {
    /// Base URL of the sync server (`realm`, `realms`, `ws` or `wss`).
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Delay before the first reconnect attempt.
    #[serde(default = "default_resumption_delay")]
    pub resumption_delay_interval_ms: u64,

    /// Upper bound on the reconnect delay.
    #[serde(default = "default_max_resumption_delay")]
    pub max_resumption_delay_interval_ms: u64,

    /// Factor applied to the delay after each consecutive failure.
    #[serde(default = "default_backoff_multiplier")]
    pub resumption_delay_backoff_multiplier: u32,

    /// Up to `delay / delay_jitter_divisor` is subtracted at random.
    #[serde(default = "default_jitter_divisor")]
    pub delay_jitter_divisor: u32,

    /// A reconnect within this window of the last disconnect activates
    /// uploads without waiting for download completion.
    #[serde(default = "default_fast_reconnect_limit")]
    pub fast_reconnect_limit_ms: u64,

    /// Default stop policy for new sessions.
    #[serde(default)]
    pub stop_policy: StopPolicy,

    /// User agent announced during the handshake.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_server_url() -> String {
    "wss://localhost/api/client/v2.0".to_string()
}

fn default_resumption_delay() -> u64 {
    DEFAULT_RESUMPTION_DELAY_MS
}

fn default_max_resumption_delay() -> u64 {
    DEFAULT_MAX_RESUMPTION_DELAY_MS
}

fn default_backoff_multiplier() -> u32 {
    DEFAULT_RESUMPTION_BACKOFF_MULTIPLIER
}

fn default_jitter_divisor() -> u32 {
    DEFAULT_DELAY_JITTER_DIVISOR
}

fn default_fast_reconnect_limit() -> u64 {
    DEFAULT_FAST_RECONNECT_LIMIT_MS
}

fn default_user_agent() -> String {
    concat!("vellum/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            resumption_delay_interval_ms: default_resumption_delay(),
            max_resumption_delay_interval_ms: default_max_resumption_delay(),
            resumption_delay_backoff_multiplier: default_backoff_multiplier(),
            delay_jitter_divisor: default_jitter_divisor(),
            fast_reconnect_limit_ms: default_fast_reconnect_limit(),
            stop_policy: StopPolicy::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl SyncClientConfig {
    /// Parses a configuration from TOML; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(s).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    /// Creates a configuration with short delays for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            resumption_delay_interval_ms: 10,
            max_resumption_delay_interval_ms: 100,
            fast_reconnect_limit_ms: 1000,
            ..Default::default()
        }
    }

    /// Sets the server URL.
    #[must_use]
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Initial reconnect delay.
    #[must_use]
    pub fn resumption_delay_interval(&self) -> Duration {
        Duration::from_millis(self.resumption_delay_interval_ms)
    }

    /// Maximum reconnect delay.
    #[must_use]
    pub fn max_resumption_delay_interval(&self) -> Duration {
        Duration::from_millis(self.max_resumption_delay_interval_ms)
    }

    /// Fast reconnect window.
    #[must_use]
    pub fn fast_reconnect_limit(&self) -> Duration {
        Duration::from_millis(self.fast_reconnect_limit_ms)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.resumption_delay_interval_ms == 0 {
            return Err("resumption_delay_interval_ms must be positive".to_string());
        }
        if self.max_resumption_delay_interval_ms < self.resumption_delay_interval_ms {
            return Err(
                "max_resumption_delay_interval_ms must be at least the initial delay".to_string(),
            );
        }
        if self.resumption_delay_backoff_multiplier == 0 {
            return Err("resumption_delay_backoff_multiplier must be positive".to_string());
        }
        if self.delay_jitter_divisor == 0 {
            return Err("delay_jitter_divisor must be positive".to_string());
        }
        Ok(())
    }
}

/// Per-session sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Partition value for partition-based sync.
    #[serde(default)]
    pub partition_value: String,

    /// Protocol flavor.
    #[serde(default)]
    pub mode: SyncMode,

    /// Stop policy; overrides the client default when set.
    #[serde(default)]
    pub stop_policy: Option<StopPolicy>,

    /// Client reset handling.
    #[serde(default)]
    pub client_resync_mode: ClientResyncMode,

    /// Identity of the user owning the session.
    #[serde(default)]
    pub user_id: String,
}

impl SyncConfig {
    /// Creates a partition-based configuration.
    #[must_use]
    pub fn partition(user_id: impl Into<String>, partition_value: impl Into<String>) -> Self {
        Self {
            partition_value: partition_value.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Creates a flexible sync configuration.
    #[must_use]
    pub fn flexible(user_id: impl Into<String>) -> Self {
        Self {
            mode: SyncMode::Flx,
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Sets the client reset mode.
    #[must_use]
    pub fn with_client_resync_mode(mut self, mode: ClientResyncMode) -> Self {
        self.client_resync_mode = mode;
        self
    }

    /// Sets the stop policy.
    #[must_use]
    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = Some(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncClientConfig::default();
        assert_eq!(config.resumption_delay_interval(), Duration::from_secs(1));
        assert_eq!(
            config.max_resumption_delay_interval(),
            Duration::from_secs(300)
        );
        assert_eq!(config.resumption_delay_backoff_multiplier, 2);
        assert_eq!(config.delay_jitter_divisor, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = SyncClientConfig::for_testing().with_server_url("ws://127.0.0.1:9090");
        let text = config.to_toml_string().unwrap();
        let parsed = SyncClientConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.server_url, "ws://127.0.0.1:9090");
        assert_eq!(parsed.resumption_delay_interval_ms, 10);
    }

    #[test]
    fn test_toml_rejects_invalid() {
        let err = SyncClientConfig::from_toml_str(
            "resumption_delay_interval_ms = 100\nmax_resumption_delay_interval_ms = 50\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_sync_config_json() {
        let config = SyncConfig::flexible("user-1")
            .with_client_resync_mode(ClientResyncMode::DiscardLocal);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"flx\""));
        assert!(json.contains("\"discard_local\""));
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, SyncMode::Flx);
    }
}
