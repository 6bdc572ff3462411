//! rumkit common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the rumkit crates:
//! - Session identity
//! - Common error types
//! - Wall-clock abstraction
//! - Agent configuration loading and validation

pub mod clock;
pub mod config;
pub mod error;
pub mod id;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AgentConfig, ConfigPaths, ConfigResolution, ConfigResolver, ConfigSource};
pub use error::{Error, ErrorCategory, Result};
pub use id::SessionId;
