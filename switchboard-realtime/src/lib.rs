//! Real-time channel for Switchboard
//!
//! - [`ChannelSupervisor`]: keeps one authenticated connection alive and in
//!   step with the session, with backoff and credential refresh
//! - [`Transport`]: the seam to the wire, with an in-process
//!   [`MemoryTransport`]
//! - Per-event listeners and explicit room membership

pub mod error;
pub mod listeners;
pub mod memory;
pub mod protocol;
pub mod reconnect;
pub mod supervisor;
pub mod transport;

pub use error::{RealtimeError, RealtimeResult};
pub use listeners::{Handler, ListenerId, ListenerRegistry};
pub use memory::MemoryTransport;
pub use protocol::{AuthPayload, ClientFrame, ServerFrame};
pub use reconnect::ReconnectPolicy;
pub use supervisor::{ChannelSupervisor, ConnectionStatus, CredentialSource, SupervisorEvent};
pub use transport::{Connection, FrameSink, Transport, TransportError};
