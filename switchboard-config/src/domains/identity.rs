//! Identity provider and tenant service endpoints

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_required_string, validate_route, validate_url, Validatable};

/// Where the identity provider and tenant management service live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base URL shared by every route below
    pub base_url: String,

    pub login_path: String,

    /// Returns the current session for a bearer credential (hydration)
    pub session_path: String,

    pub refresh_path: String,

    pub logout_path: String,

    /// Root of the tenant management routes
    pub tenants_path: String,

    /// Per-request timeout
    #[serde(with = "crate::domains::utils::serde_duration")]
    pub timeout: Duration,

    pub user_agent: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            login_path: "/auth/login".to_string(),
            session_path: "/auth/me".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            tenants_path: "/tenants".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: format!("switchboard/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl IdentityConfig {
    /// Join the base URL and a route path
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl Validatable for IdentityConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_url(&self.base_url, "base_url", domain)?;
        for (field, path) in [
            ("login_path", &self.login_path),
            ("session_path", &self.session_path),
            ("refresh_path", &self.refresh_path),
            ("logout_path", &self.logout_path),
            ("tenants_path", &self.tenants_path),
        ] {
            validate_route(path, field, domain)?;
        }
        validate_duration(self.timeout, "timeout", domain)?;
        validate_required_string(&self.user_agent, "user_agent", domain)?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "identity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(IdentityConfig::default().validate().is_ok());
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let config = IdentityConfig {
            base_url: "https://id.example.com/api/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.endpoint(&config.login_path), "https://id.example.com/api/auth/login");
    }

    #[test]
    fn test_invalid_route_rejected() {
        let config = IdentityConfig {
            refresh_path: "auth/refresh".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
