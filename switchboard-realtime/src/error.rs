//! Real-time channel errors

use switchboard_session::SessionError;
use thiserror::Error;

use crate::transport::TransportError;

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The credential was rejected and could not be refreshed
    #[error("Channel authentication rejected: {0}")]
    AuthRejected(String),

    /// Reconnection gave up
    #[error("Connection lost after {attempts} attempts")]
    ConnectionLost { attempts: u32 },

    #[error("Channel closed")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),
}
