//! Logging configuration for hosts that let the agent install a subscriber.
//!
//! `RUMKIT_LOG` sets the level for the rumkit crates only and
//! `RUMKIT_LOG_FORMAT` picks human or JSON lines. A `RUST_LOG` filter, when
//! set, replaces the rumkit directive entirely (see [`super::init_logging`]).

use tracing_subscriber::filter::LevelFilter;

/// Env var selecting the level for rumkit targets.
pub const ENV_LOG: &str = "RUMKIT_LOG";
/// Env var selecting the output format.
pub const ENV_LOG_FORMAT: &str = "RUMKIT_LOG_FORMAT";

/// Targets covered by the rumkit directive.
pub const AGENT_TARGETS: [&str; 4] = ["rk_core", "rk_export", "rk_cache", "rk_common"];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per line, event fields flattened.
    Jsonl,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "pretty" => Ok(LogFormat::Human),
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            _ => Err(format!("unknown log format: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LevelFilter,
    /// Show the agent's worker thread names (`rk-anr-detect`, `rk-pulse`, ...).
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Human,
            level: LevelFilter::INFO,
            thread_names: true,
        }
    }
}

impl LogConfig {
    /// Defaults overlaid with `RUMKIT_LOG` and `RUMKIT_LOG_FORMAT`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = lookup(ENV_LOG).and_then(|v| v.parse().ok()) {
            config.level = level;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT).and_then(|v| v.parse().ok()) {
            config.format = format;
        }
        config
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// `EnvFilter` directive enabling `level` for every rumkit crate and
    /// nothing else.
    pub fn filter_directive(&self) -> String {
        AGENT_TARGETS
            .iter()
            .map(|target| format!("{target}={}", self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}
