//! Configuration loading and environment variable handling

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::domains::{
    identity::IdentityConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    realtime::RealtimeConfig,
    session::SessionConfig,
    utils::parse_duration,
    SwitchboardConfig,
};
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "SWITCHBOARD".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<SwitchboardConfig> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");
        let content = std::fs::read_to_string(path)?;
        self.from_yaml(&content)
    }

    /// Parse YAML, then apply environment overrides and validate
    pub fn from_yaml(&self, content: &str) -> ConfigResult<SwitchboardConfig> {
        let mut config: SwitchboardConfig = if content.trim().is_empty() {
            SwitchboardConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<SwitchboardConfig> {
        let mut config = SwitchboardConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<SwitchboardConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut SwitchboardConfig) -> ConfigResult<()> {
        self.apply_identity_overrides(&mut config.identity)?;
        self.apply_session_overrides(&mut config.session)?;
        self.apply_realtime_overrides(&mut config.realtime)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_identity_overrides(&self, config: &mut IdentityConfig) -> ConfigResult<()> {
        if let Some(base_url) = self.get_env_var("IDENTITY_BASE_URL") {
            config.base_url = base_url;
        }

        if let Some(timeout) = self.get_env_var("IDENTITY_TIMEOUT") {
            config.timeout = self.parse_duration_var("IDENTITY_TIMEOUT", &timeout)?;
        }

        Ok(())
    }

    fn apply_session_overrides(&self, config: &mut SessionConfig) -> ConfigResult<()> {
        if let Some(max_age) = self.get_env_var("COOKIE_MAX_AGE") {
            config.cookie_max_age = self.parse_duration_var("COOKIE_MAX_AGE", &max_age)?;
        }

        if let Some(secure) = self.get_env_var("COOKIE_SECURE") {
            config.cookie_secure = self.parse_var("COOKIE_SECURE", &secure)?;
        }

        if let Some(path) = self.get_env_var("STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }

        Ok(())
    }

    fn apply_realtime_overrides(&self, config: &mut RealtimeConfig) -> ConfigResult<()> {
        if let Some(url) = self.get_env_var("REALTIME_URL") {
            config.url = Some(url);
        }

        if let Some(attempts) = self.get_env_var("REALTIME_MAX_ATTEMPTS") {
            config.max_attempts = self.parse_var("REALTIME_MAX_ATTEMPTS", &attempts)?;
        }

        if let Some(delay) = self.get_env_var("REALTIME_INITIAL_DELAY") {
            config.initial_delay = self.parse_duration_var("REALTIME_INITIAL_DELAY", &delay)?;
        }

        if let Some(delay) = self.get_env_var("REALTIME_MAX_DELAY") {
            config.max_delay = self.parse_duration_var("REALTIME_MAX_DELAY", &delay)?;
        }

        if let Some(jitter) = self.get_env_var("REALTIME_JITTER") {
            config.jitter = self.parse_var("REALTIME_JITTER", &jitter)?;
        }

        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Some(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Some(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn parse_var<T>(&self, name: &str, value: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value
            .trim()
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e)))
    }

    fn parse_duration_var(&self, name: &str, value: &str) -> ConfigResult<Duration> {
        parse_duration(value).map_err(|e| ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e)))
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}_{}", self.prefix, name)).ok()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
