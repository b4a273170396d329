//! Configuration validation traits and utilities

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a non-zero duration
pub fn validate_duration(value: Duration, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0", field_name),
        });
    }
    Ok(())
}

/// Validate an http(s) or ws(s) URL
pub fn validate_url(url: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    validate_required_string(url, field_name, domain)?;

    let parsed = url::Url::parse(url).map_err(|e| ConfigError::DomainError {
        domain: domain.to_string(),
        message: format!("{} has invalid URL format: {}", field_name, e),
    })?;

    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(()),
        scheme => Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} scheme '{}' is not supported", field_name, scheme),
        }),
    }
}

/// Validate a route path such as `/auth/login`
pub fn validate_route(path: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if !path.starts_with('/') {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must start with '/', got '{}'", field_name, path),
        });
    }
    Ok(())
}

/// Validate an enum choice
pub fn validate_enum_choice<T>(value: &str, valid_choices: &[T], field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: AsRef<str>,
{
    let valid: Vec<&str> = valid_choices.iter().map(|c| c.as_ref()).collect();

    if !valid.iter().any(|&v| v.eq_ignore_ascii_case(value)) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} has invalid value '{}'. Valid choices: {}",
                field_name,
                value,
                valid.join(", ")
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://api.example.com", "base_url", "identity").is_ok());
        assert!(validate_url("wss://rt.example.com/socket", "url", "realtime").is_ok());

        let err = validate_url("ftp://files.example.com", "base_url", "identity").unwrap_err();
        assert_eq!(err.domain(), Some("identity"));
        assert!(validate_url("", "base_url", "identity").is_err());
        assert!(validate_url("not a url", "base_url", "identity").is_err());
    }

    #[test]
    fn test_validate_route() {
        assert!(validate_route("/auth/login", "login_path", "identity").is_ok());
        assert!(validate_route("auth/login", "login_path", "identity").is_err());
    }

    #[test]
    fn test_validate_positive_and_duration() {
        assert!(validate_positive(3u32, "max_attempts", "realtime").is_ok());
        assert!(validate_positive(0u32, "max_attempts", "realtime").is_err());
        assert!(validate_positive(0.5f64, "backoff_multiplier", "realtime").is_ok());
        assert!(validate_duration(Duration::ZERO, "timeout", "identity").is_err());
    }

    #[test]
    fn test_validate_enum_choice() {
        assert!(validate_enum_choice("Strict", &["strict", "lax"], "same_site", "session").is_ok());
        assert!(validate_enum_choice("none", &["strict", "lax"], "same_site", "session").is_err());
    }
}
