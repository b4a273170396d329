//! Transport seam of the real-time channel

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{AuthPayload, ClientFrame, ServerFrame};

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The handshake credential was refused
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

/// Outgoing half of a live connection
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: ClientFrame) -> Result<(), TransportError>;

    fn close(&self);
}

/// An authenticated connection.
///
/// `incoming` yielding `None` means the transport dropped the connection.
pub struct Connection {
    pub sink: Arc<dyn FrameSink>,
    pub incoming: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Opens authenticated connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, auth: &AuthPayload) -> Result<Connection, TransportError>;
}
