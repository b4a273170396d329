//! Real-time channel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, validate_required_string, validate_url, Validatable};

/// Connection and reconnection settings for the real-time supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Real-time endpoint, when a network transport is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Connection attempts before giving up, auth rejections included
    pub max_attempts: u32,

    #[serde(with = "crate::domains::utils::serde_duration")]
    pub initial_delay: Duration,

    #[serde(with = "crate::domains::utils::serde_duration")]
    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    #[serde(default = "crate::domains::utils::default_true")]
    pub jitter: bool,

    /// Handshake timeout per attempt
    #[serde(with = "crate::domains::utils::serde_duration")]
    pub connection_timeout: Duration,

    pub personal_room_prefix: String,

    pub tenant_room_prefix: String,

    /// Buffer size of the supervisor event broadcast
    pub event_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            connection_timeout: Duration::from_secs(10),
            personal_room_prefix: "user:".to_string(),
            tenant_room_prefix: "tenant:".to_string(),
            event_capacity: 64,
        }
    }
}

impl Validatable for RealtimeConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        if let Some(url) = &self.url {
            validate_url(url, "url", domain)?;
        }
        validate_positive(self.max_attempts, "max_attempts", domain)?;
        validate_duration(self.initial_delay, "initial_delay", domain)?;
        validate_duration(self.connection_timeout, "connection_timeout", domain)?;
        if self.max_delay < self.initial_delay {
            return Err(self.validation_error("max_delay must not be shorter than initial_delay"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(self.validation_error(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        validate_required_string(&self.personal_room_prefix, "personal_room_prefix", domain)?;
        validate_required_string(&self.tenant_room_prefix, "tenant_room_prefix", domain)?;
        if self.personal_room_prefix == self.tenant_room_prefix {
            return Err(self.validation_error("room prefixes must differ"));
        }
        validate_positive(self.event_capacity, "event_capacity", domain)?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "realtime"
    }
}
