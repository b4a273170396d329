//! Credential store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_enum_choice, validate_required_string, Validatable};

/// Keys and lifetimes for the persisted and cookie-transported credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Storage and cookie key for the bearer token
    pub token_key: String,

    /// Storage and cookie key for the active tenant id
    pub tenant_key: String,

    /// Max-Age of the credential cookies
    #[serde(with = "crate::domains::utils::serde_duration")]
    pub cookie_max_age: Duration,

    /// SameSite attribute: strict or lax
    pub cookie_same_site: String,

    #[serde(default = "crate::domains::utils::default_false")]
    pub cookie_secure: bool,

    /// Persist the credential to this JSON file instead of memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_key: "auth_token".to_string(),
            tenant_key: "current_tenant_id".to_string(),
            cookie_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            cookie_same_site: "strict".to_string(),
            cookie_secure: false,
            storage_path: None,
        }
    }
}

impl Validatable for SessionConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_required_string(&self.token_key, "token_key", domain)?;
        validate_required_string(&self.tenant_key, "tenant_key", domain)?;
        if self.token_key == self.tenant_key {
            return Err(self.validation_error("token_key and tenant_key must differ"));
        }
        validate_duration(self.cookie_max_age, "cookie_max_age", domain)?;
        validate_enum_choice(&self.cookie_same_site, &["strict", "lax"], "cookie_same_site", domain)?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "session"
    }
}
