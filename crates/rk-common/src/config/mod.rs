//! Agent configuration loading and validation.
//!
//! This module provides:
//! - The typed [`AgentConfig`] with serde defaults for every field
//! - Deterministic config resolution (explicit path > env > XDG > defaults)
//! - Semantic validation of timing values

pub mod resolve;

pub use resolve::{ConfigPaths, ConfigResolver};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Agent configuration.
///
/// All durations are expressed in (possibly fractional) seconds so config
/// files stay readable. Accessors convert to [`Duration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Minimum stall length reported as an ANR.
    pub anr_threshold_secs: f64,
    /// Stalls are reported at this length even if still ongoing.
    pub max_anr_duration_secs: f64,
    /// Period of the main-context heartbeat.
    pub anr_heartbeat_interval_secs: f64,
    /// Period of the background detection check.
    pub anr_check_interval_secs: f64,
    /// Scheduling slack allowed for the detection check.
    pub anr_check_leeway_ms: u64,
    pub anr_enabled: bool,

    /// Background time after which the next foreground starts a new session.
    pub session_timeout_secs: f64,
    pub max_session_length_secs: f64,
    pub session_refresh_interval_secs: f64,
    /// Closed session records are kept this long beyond their max length.
    pub session_retention_margin_secs: f64,

    pub pulse_interval_secs: f64,

    /// Capacity for general-purpose module caches. `None` is unbounded.
    pub cache_capacity: Option<usize>,
    /// Max entry age for general-purpose module caches. `None` keeps forever.
    pub cache_max_lifetime_secs: Option<f64>,

    /// Delivery attempts allowed before an event is dropped.
    pub upload_retry_ceiling: u32,
    pub request_timeout_secs: f64,
    /// Collector URL. Without one the agent runs in no-op mode.
    pub endpoint: Option<String>,
    /// Extra headers sent with every upload.
    pub headers: BTreeMap<String, String>,

    /// Root of all persisted state. Resolved from `RUMKIT_DATA` or the
    /// platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    pub app_name: String,
    pub instrumentation_scope: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            anr_threshold_secs: 2.0,
            max_anr_duration_secs: 10.0,
            anr_heartbeat_interval_secs: 0.1,
            anr_check_interval_secs: 0.15,
            anr_check_leeway_ms: 100,
            anr_enabled: true,
            session_timeout_secs: 15.0 * 60.0,
            max_session_length_secs: 60.0 * 60.0,
            session_refresh_interval_secs: 1.0,
            session_retention_margin_secs: 30.0 * 24.0 * 60.0 * 60.0,
            pulse_interval_secs: 5.0 * 60.0,
            cache_capacity: None,
            cache_max_lifetime_secs: None,
            upload_retry_ceiling: 5,
            request_timeout_secs: 30.0,
            endpoint: None,
            headers: BTreeMap::new(),
            data_dir: None,
            app_name: "rumkit".to_string(),
            instrumentation_scope: "rumkit".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load configuration with resolution from explicit path, env, or defaults.
    pub fn load(resolver: &ConfigResolver) -> Result<(Self, ConfigSource)> {
        resolver.load_agent_config()
    }

    /// Validate configuration semantically.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("anr_threshold_secs", self.anr_threshold_secs),
            ("max_anr_duration_secs", self.max_anr_duration_secs),
            ("anr_heartbeat_interval_secs", self.anr_heartbeat_interval_secs),
            ("anr_check_interval_secs", self.anr_check_interval_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("max_session_length_secs", self.max_session_length_secs),
            ("session_refresh_interval_secs", self.session_refresh_interval_secs),
            ("pulse_interval_secs", self.pulse_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!("{name} must be > 0, got {value}")));
            }
            check_upper_bound(name, value)?;
        }

        let margin = self.session_retention_margin_secs;
        if !margin.is_finite() || margin < 0.0 {
            return Err(Error::Config(format!(
                "session_retention_margin_secs must be >= 0, got {margin}"
            )));
        }
        check_upper_bound("session_retention_margin_secs", margin)?;

        if self.anr_threshold_secs >= self.max_anr_duration_secs {
            return Err(Error::Config(format!(
                "anr_threshold_secs ({}) must be below max_anr_duration_secs ({})",
                self.anr_threshold_secs, self.max_anr_duration_secs
            )));
        }

        if self.anr_heartbeat_interval_secs >= self.anr_check_interval_secs {
            return Err(Error::Config(format!(
                "anr_heartbeat_interval_secs ({}) must be below anr_check_interval_secs ({})",
                self.anr_heartbeat_interval_secs, self.anr_check_interval_secs
            )));
        }

        if let Some(lifetime) = self.cache_max_lifetime_secs {
            if !lifetime.is_finite() || lifetime <= 0.0 {
                return Err(Error::Config(format!(
                    "cache_max_lifetime_secs must be > 0, got {lifetime}"
                )));
            }
            check_upper_bound("cache_max_lifetime_secs", lifetime)?;
        }

        if self.cache_capacity == Some(0) {
            return Err(Error::Config("cache_capacity must be > 0".to_string()));
        }

        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::InvalidEndpoint(endpoint.clone()));
            }
        }

        if self.instrumentation_scope.trim().is_empty() {
            return Err(Error::Config("instrumentation_scope must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn anr_threshold(&self) -> Duration {
        secs(self.anr_threshold_secs)
    }

    pub fn max_anr_duration(&self) -> Duration {
        secs(self.max_anr_duration_secs)
    }

    pub fn anr_heartbeat_interval(&self) -> Duration {
        secs(self.anr_heartbeat_interval_secs)
    }

    pub fn anr_check_interval(&self) -> Duration {
        secs(self.anr_check_interval_secs)
    }

    pub fn anr_check_leeway(&self) -> Duration {
        Duration::from_millis(self.anr_check_leeway_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        secs(self.session_timeout_secs)
    }

    pub fn max_session_length(&self) -> Duration {
        secs(self.max_session_length_secs)
    }

    pub fn session_refresh_interval(&self) -> Duration {
        secs(self.session_refresh_interval_secs)
    }

    pub fn session_retention_margin(&self) -> Duration {
        secs(self.session_retention_margin_secs)
    }

    pub fn pulse_interval(&self) -> Duration {
        secs(self.pulse_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn cache_max_lifetime(&self) -> Option<Duration> {
        self.cache_max_lifetime_secs.map(secs)
    }

    /// Data directory: explicit field, then `RUMKIT_DATA`, then the platform
    /// local data dir.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        if let Ok(dir) = std::env::var(resolve::ENV_DATA) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
        dirs::data_local_dir()
            .map(|d| d.join("rumkit"))
            .ok_or_else(|| Error::Config("no data directory available".to_string()))
    }
}

/// Configuration source for a file.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file, or None if using defaults
    pub path: Option<String>,
    /// SHA-256 hash of file contents, or None if defaults
    pub hash: Option<String>,
    /// How this source was resolved
    pub resolution: ConfigResolution,
}

/// How a config path was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigResolution {
    /// Explicit path passed by the host
    Explicit,
    /// From RUMKIT_CONFIG
    EnvVar,
    /// From the platform config dir
    XdgConfig,
    /// Built-in defaults
    Default,
}

/// Longest duration any setting may hold (100 years).
pub const MAX_DURATION_SECS: f64 = 100.0 * 365.0 * 24.0 * 60.0 * 60.0;

fn check_upper_bound(name: &str, value: f64) -> Result<()> {
    if value > MAX_DURATION_SECS {
        return Err(Error::Config(format!(
            "{name} must be at most {MAX_DURATION_SECS} seconds, got {value}"
        )));
    }
    Ok(())
}

/// Saturating seconds-to-duration conversion. Negative and NaN map to zero.
fn secs(value: f64) -> Duration {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => duration,
        Err(_) if value > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.session_timeout(), Duration::from_secs(900));
        assert_eq!(config.max_session_length(), Duration::from_secs(3600));
        assert_eq!(config.pulse_interval(), Duration::from_secs(300));
        assert_eq!(config.anr_check_interval(), Duration::from_millis(150));
        assert_eq!(config.upload_retry_ceiling, 5);
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn test_threshold_must_be_below_max() {
        let config = AgentConfig {
            anr_threshold_secs: 10.0,
            max_anr_duration_secs: 10.0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = AgentConfig {
            session_refresh_interval_secs: 0.0,
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session_refresh_interval_secs"));
    }

    #[test]
    fn test_heartbeat_must_be_faster_than_check() {
        let config = AgentConfig {
            anr_heartbeat_interval_secs: 0.2,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let config = AgentConfig {
            max_session_length_secs: 1e20,
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_session_length_secs"));

        let config = AgentConfig {
            cache_max_lifetime_secs: Some(f64::MAX),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accessors_saturate_instead_of_panicking() {
        let config = AgentConfig {
            max_session_length_secs: 1e20,
            session_timeout_secs: -1.0,
            pulse_interval_secs: f64::NAN,
            ..AgentConfig::default()
        };
        assert_eq!(config.max_session_length(), Duration::MAX);
        assert_eq!(config.session_timeout(), Duration::ZERO);
        assert_eq!(config.pulse_interval(), Duration::ZERO);
    }

    #[test]
    fn test_endpoint_scheme_checked() {
        let config = AgentConfig {
            endpoint: Some("ftp://collector".to_string()),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidEndpoint(_))));

        let config = AgentConfig {
            endpoint: Some("https://collector.example/v1/logs".to_string()),
            ..AgentConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str("session_timeout_secs = 60.0\n").unwrap();
        assert_eq!(config.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_anr_duration_secs, 10.0);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<AgentConfig, _> = toml::from_str("bogus = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let config = AgentConfig {
            data_dir: Some(PathBuf::from("/tmp/rk-explicit")),
            ..AgentConfig::default()
        };
        assert_eq!(
            config.resolve_data_dir().unwrap(),
            PathBuf::from("/tmp/rk-explicit")
        );
    }
}
