//! Domain-specific configuration modules

pub mod identity;
pub mod logging;
pub mod realtime;
pub mod session;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Switchboard configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Identity provider and tenant service endpoints
    #[serde(default)]
    pub identity: identity::IdentityConfig,

    /// Credential store keys and cookie attributes
    #[serde(default)]
    pub session: session::SessionConfig,

    /// Real-time channel reconnection policy
    #[serde(default)]
    pub realtime: realtime::RealtimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl SwitchboardConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.identity.validate()?;
        self.session.validate()?;
        self.realtime.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = SwitchboardConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
