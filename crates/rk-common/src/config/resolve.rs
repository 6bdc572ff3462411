//! Configuration resolution for the agent.
//!
//! Implements deterministic config resolution order:
//! 1. Explicit path passed by the host
//! 2. Environment variable (RUMKIT_CONFIG)
//! 3. Platform config dir (~/.config/rumkit/agent.toml)
//! 4. Built-in defaults

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{AgentConfig, ConfigResolution, ConfigSource};
use crate::error::{Error, Result};

/// Env var naming an explicit config file.
pub const ENV_CONFIG: &str = "RUMKIT_CONFIG";
/// Env var naming the data directory.
pub const ENV_DATA: &str = "RUMKIT_DATA";

const CONFIG_FILE_NAME: &str = "agent.toml";

/// Configuration file paths.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Explicit path to the agent config file (TOML or JSON)
    pub config_path: Option<PathBuf>,
}

/// Configuration resolver with deterministic resolution order.
#[derive(Debug)]
pub struct ConfigResolver {
    paths: ConfigPaths,
}

impl ConfigResolver {
    pub fn new(paths: ConfigPaths) -> Self {
        ConfigResolver { paths }
    }

    /// Create a resolver with no explicit overrides.
    pub fn with_defaults() -> Self {
        ConfigResolver {
            paths: ConfigPaths::default(),
        }
    }

    /// Resolve the agent config file path.
    pub fn resolve_config_path(&self) -> (Option<PathBuf>, ConfigResolution) {
        // 1. Explicit
        if let Some(ref path) = self.paths.config_path {
            return (Some(path.clone()), ConfigResolution::Explicit);
        }

        // 2. RUMKIT_CONFIG env var
        if let Ok(path) = env::var(ENV_CONFIG) {
            if !path.is_empty() {
                return (Some(PathBuf::from(path)), ConfigResolution::EnvVar);
            }
        }

        // 3. Platform config dir, only if the file exists
        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("rumkit").join(CONFIG_FILE_NAME);
            if path.exists() {
                return (Some(path), ConfigResolution::XdgConfig);
            }
        }

        // 4. Default
        (None, ConfigResolution::Default)
    }

    /// Load the agent config from the resolved path or defaults.
    pub fn load_agent_config(&self) -> Result<(AgentConfig, ConfigSource)> {
        let (path, resolution) = self.resolve_config_path();

        match path {
            Some(p) => {
                let content = fs::read_to_string(&p).map_err(|e| {
                    Error::Config(format!("failed to read config from {}: {}", p.display(), e))
                })?;

                let hash = compute_sha256(&content);
                let config = parse_config(&p, &content)?;
                config.validate()?;

                Ok((
                    config,
                    ConfigSource {
                        path: Some(p.to_string_lossy().to_string()),
                        hash: Some(hash),
                        resolution,
                    },
                ))
            }
            None => Ok((
                AgentConfig::default(),
                ConfigSource {
                    path: None,
                    hash: None,
                    resolution: ConfigResolution::Default,
                },
            )),
        }
    }
}

/// Parse by extension: `.json` is JSON, everything else TOML.
fn parse_config(path: &Path, content: &str) -> Result<AgentConfig> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    } else {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}

/// Compute SHA-256 hash of a string.
fn compute_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_hash() {
        let hash = compute_sha256("test content");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_load_toml_from_explicit_path() {
        let mut tmp = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        tmp.write_all(
            br#"
endpoint = "https://collector.example/v1/logs"
session_timeout_secs = 120.0
upload_retry_ceiling = 3

[headers]
authorization = "Bearer abc"
"#,
        )
        .unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
        });
        let (config, source) = resolver.load_agent_config().unwrap();

        assert_eq!(source.resolution, ConfigResolution::Explicit);
        assert!(source.hash.is_some());
        assert_eq!(config.session_timeout_secs, 120.0);
        assert_eq!(config.upload_retry_ceiling, 3);
        assert_eq!(
            config.headers.get("authorization").map(String::as_str),
            Some("Bearer abc")
        );
    }

    #[test]
    fn test_load_json_by_extension() {
        let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        tmp.write_all(br#"{"pulse_interval_secs": 60.0, "anr_enabled": false}"#)
            .unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
        });
        let (config, _) = resolver.load_agent_config().unwrap();
        assert_eq!(config.pulse_interval_secs, 60.0);
        assert!(!config.anr_enabled);
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let mut tmp = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        tmp.write_all(b"anr_threshold_secs = 20.0\n").unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
        });
        assert!(matches!(
            resolver.load_agent_config(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(PathBuf::from("/nonexistent/rumkit/agent.toml")),
        });
        assert!(resolver.load_agent_config().is_err());
    }
}
