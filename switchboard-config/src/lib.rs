//! Domain-driven configuration management for Switchboard
//!
//! Configuration is split by functional domain (identity provider, session
//! stores, real-time channel, logging). Every domain has serde defaults, a
//! [`validation::Validatable`] implementation and `SWITCHBOARD_*` environment
//! overrides applied by [`ConfigLoader`].

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    identity::IdentityConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    realtime::RealtimeConfig,
    session::SessionConfig,
    SwitchboardConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration;
