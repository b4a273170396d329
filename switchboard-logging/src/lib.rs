//! Logging initialisation for Switchboard
//!
//! Everything in the workspace logs through `tracing` macros. This crate
//! installs the global subscriber from a [`LoggingConfig`].

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
pub use switchboard_config::{LogFormat, LogLevel, LoggingConfig};
