//! Bearer credentials

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use switchboard_rbac::TenantId;

/// Opaque bearer token. Never printed by `Debug`.
#[derive(Clone)]
pub struct BearerToken(Arc<Secret<String>>);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(Secret::new(token.into())))
    }

    /// Raw token, for the `Authorization` header and the stores
    pub fn expose(&self) -> &str {
        self.0.expose_secret().as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

impl PartialEq for BearerToken {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for BearerToken {}

impl From<&str> for BearerToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for BearerToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// Serialises the raw token; only wire payloads carry it.
impl Serialize for BearerToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for BearerToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// The bearer token plus the tenant context it was minted for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: BearerToken,
    pub tenant_id: TenantId,
}

impl Credential {
    pub fn new(token: impl Into<BearerToken>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            token: token.into(),
            tenant_id: tenant_id.into(),
        }
    }
}
