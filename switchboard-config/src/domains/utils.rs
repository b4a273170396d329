//! Utility functions and helpers for configuration

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serde helper for durations.
///
/// Serialises as a humantime string ("30s", "7days"); accepts either such a
/// string or a bare number of seconds.
pub mod serde_duration {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationRepr {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match DurationRepr::deserialize(deserializer)? {
            DurationRepr::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            DurationRepr::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Parse "30s", "1m 30s", "7days" or a bare number of seconds
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

/// Default functions for serde
pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}
