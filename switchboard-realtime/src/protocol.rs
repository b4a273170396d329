//! Wire protocol of the real-time channel

use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchboard_rbac::{TenantId, UserId};
use switchboard_session::{BearerToken, SessionSnapshot};

/// Handshake credentials, rebuilt from the session before every attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: BearerToken,
    pub user_id: UserId,
    pub tenant_id: TenantId,
}

impl AuthPayload {
    /// `None` unless the snapshot is authenticated
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Option<Self> {
        if !snapshot.is_authenticated() {
            return None;
        }
        let session = snapshot.session.as_deref()?;
        Some(Self {
            token: session.credential.token.clone(),
            user_id: session.identity.id.clone(),
            tenant_id: session.credential.tenant_id.clone(),
        })
    }
}

/// Frames sent by the client after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { room: String },
    Leave { room: String },
    Emit { event: String, payload: Value },
}

/// Frames pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Event { event: String, payload: Value },
    /// The credential was rejected on a live connection
    AuthError { message: String },
}
