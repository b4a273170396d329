//! In-process transport with an inspectable server side

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{AuthPayload, ClientFrame, ServerFrame};
use crate::transport::{Connection, FrameSink, Transport, TransportError};

type Validator = Arc<dyn Fn(&AuthPayload) -> bool + Send + Sync>;

struct ServerConnection {
    auth: AuthPayload,
    rooms: BTreeSet<String>,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    connections: BTreeMap<u64, ServerConnection>,
    handshakes: Vec<AuthPayload>,
    emitted: Vec<(String, Value)>,
    /// Tokens refused regardless of the validator
    rejected_tokens: HashSet<String>,
    refuse_next: u32,
}

/// Transport whose server lives in the same process
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<ServerState>>,
    validator: Validator,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Server accepting every non-empty token
    pub fn new() -> Self {
        Self::with_validator(|auth| !auth.token.is_empty())
    }

    pub fn with_validator(validator: impl Fn(&AuthPayload) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            validator: Arc::new(validator),
        }
    }

    /// Refuse the next `count` handshakes as unreachable
    pub fn refuse_next(&self, count: u32) {
        self.state.lock().refuse_next = count;
    }

    /// Drop every live connection, as a network failure would
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.state.lock().connections);
        debug!(count = dropped.len(), "Server dropped connections");
    }

    /// Reject the credentials of every live connection with an auth error frame.
    ///
    /// Their tokens are refused from now on.
    pub fn expire_sessions(&self) {
        let mut state = self.state.lock();
        let tokens: Vec<String> = state
            .connections
            .values()
            .map(|c| c.auth.token.expose().to_string())
            .collect();
        state.rejected_tokens.extend(tokens);
        for connection in state.connections.values() {
            let _ = connection.tx.send(ServerFrame::AuthError {
                message: "credential expired".to_string(),
            });
        }
    }

    /// Push an event to every connection in `room`; returns the recipient count
    pub fn broadcast(&self, room: &str, event: &str, payload: Value) -> usize {
        let state = self.state.lock();
        state
            .connections
            .values()
            .filter(|c| c.rooms.contains(room))
            .filter(|c| {
                c.tx
                    .send(ServerFrame::Event {
                        event: event.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Every handshake attempted, accepted or not
    pub fn handshakes(&self) -> Vec<AuthPayload> {
        self.state.lock().handshakes.clone()
    }

    /// Rooms joined by the live connections, merged
    pub fn joined_rooms(&self) -> BTreeSet<String> {
        let state = self.state.lock();
        state.connections.values().flat_map(|c| c.rooms.iter().cloned()).collect()
    }

    /// Events received from clients
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.state.lock().emitted.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, auth: &AuthPayload) -> Result<Connection, TransportError> {
        let mut state = self.state.lock();
        state.handshakes.push(auth.clone());

        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(TransportError::Unreachable("connection refused".to_string()));
        }
        if state.rejected_tokens.contains(auth.token.expose()) || !(self.validator)(auth) {
            return Err(TransportError::AuthRejected("invalid credential".to_string()));
        }

        state.next_id += 1;
        let id = state.next_id;
        let (tx, incoming) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            ServerConnection {
                auth: auth.clone(),
                rooms: BTreeSet::new(),
                tx,
            },
        );
        debug!(connection_id = id, user_id = %auth.user_id, "Server accepted connection");

        Ok(Connection {
            sink: Arc::new(MemorySink {
                state: self.state.clone(),
                id,
            }),
            incoming,
        })
    }
}

struct MemorySink {
    state: Arc<Mutex<ServerState>>,
    id: u64,
}

impl FrameSink for MemorySink {
    fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let connection = state.connections.get_mut(&self.id).ok_or(TransportError::Closed)?;
        match frame {
            ClientFrame::Join { room } => {
                connection.rooms.insert(room);
            }
            ClientFrame::Leave { room } => {
                connection.rooms.remove(&room);
            }
            ClientFrame::Emit { event, payload } => state.emitted.push((event, payload)),
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().connections.remove(&self.id);
    }
}
