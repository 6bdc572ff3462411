//! Structured logging for the agent.
//!
//! The agent never installs a subscriber on its own. Hosts without one can
//! call [`init_logging`] once at start-up; output goes to stderr as human
//! text or JSON lines.
//!
//! Log events carry `event` and `component` fields from [`events`].
//! Payloads and header values are never logged.

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat};
pub use events::{event_names, Component};

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Install a global subscriber.
///
/// Fails if the host already installed one.
pub fn init_logging(config: &LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_names(config.thread_names)
                .with_ansi(use_ansi);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Jsonl => {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_thread_names(config.thread_names)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
        }
    }
}

/// [`init_logging`] with [`LogConfig::from_env`], leaving an existing
/// subscriber in place.
pub fn init_default_logging() {
    let _ = init_logging(&LogConfig::from_env());
}

/// Shorten a value for logging.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}
