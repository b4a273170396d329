//! Connection supervisor for the real-time channel
//!
//! [`ChannelSupervisor`] owns one authenticated connection at a time and keeps
//! it aligned with the session: it reconnects with backoff when the transport
//! drops, re-authenticates through the [`SessionManager`] when the credential
//! is rejected, reconnects when the tenant or credential changes, and
//! disconnects when the session ends. It reports progress only through
//! [`SupervisorEvent`]s and the status watch.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchboard_config::RealtimeConfig;
use switchboard_rbac::{TenantId, UserId};
use switchboard_session::{Credential, SessionError, SessionManager, SessionResult, SessionSnapshot};

use crate::error::{RealtimeError, RealtimeResult};
use crate::listeners::{Handler, ListenerId, ListenerRegistry};
use crate::protocol::{AuthPayload, ClientFrame, ServerFrame};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{FrameSink, Transport, TransportError};

/// Where the supervisor reads the session and asks for fresh credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn snapshot(&self) -> SessionSnapshot;

    fn subscribe(&self) -> watch::Receiver<SessionSnapshot>;

    /// Reissue the credential; a rejection ends the session
    async fn refresh_credential(&self) -> SessionResult<Credential>;
}

#[async_trait]
impl CredentialSource for SessionManager {
    fn snapshot(&self) -> SessionSnapshot {
        SessionManager::snapshot(self)
    }

    fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        SessionManager::subscribe(self)
    }

    async fn refresh_credential(&self) -> SessionResult<Credential> {
        SessionManager::refresh_credential(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
    /// The credential was rejected; a refresh is in progress
    AuthError,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::AuthError => "auth_error",
        };
        f.write_str(name)
    }
}

/// Progress reported to presentation layers
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StatusChanged(ConnectionStatus),
    Connected { user_id: UserId, tenant_id: TenantId },
    Reconnecting { attempt: u32, delay: Duration },
    /// Attempts are exhausted; nothing happens until `connect()` is called again
    ConnectionLost { attempts: u32 },
    AuthRefreshed,
    AuthFailed { message: String },
}

/// Why the driver stopped
#[derive(Debug, Clone)]
enum Exit {
    SignedOut,
    Lost { attempts: u32 },
    AuthFailed(String),
    Shutdown,
}

impl Exit {
    fn into_error(self) -> RealtimeError {
        match self {
            Exit::SignedOut => RealtimeError::Session(SessionError::NotAuthenticated),
            Exit::Lost { attempts } => RealtimeError::ConnectionLost { attempts },
            Exit::AuthFailed(message) => RealtimeError::AuthRejected(message),
            Exit::Shutdown => RealtimeError::Closed,
        }
    }
}

/// Why a connection (or an attempt at one) ended
enum Interrupt {
    Dropped(String),
    AuthRejected(String),
    SessionChanged,
    SignedOut,
}

enum RefreshOutcome {
    Refreshed,
    Unavailable,
    Failed(Exit),
}

#[derive(Default)]
struct Channel {
    sink: Option<Arc<dyn FrameSink>>,
    /// Personal and tenant rooms of the current connection
    session_rooms: Vec<String>,
    /// Rooms joined by consumers, re-joined on every connection
    rooms: BTreeSet<String>,
}

struct Shared {
    source: Arc<dyn CredentialSource>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    config: RealtimeConfig,
    listeners: ListenerRegistry,
    channel: Mutex<Channel>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<SupervisorEvent>,
    exit: Mutex<Option<Exit>>,
}

/// Keeps the real-time channel connected and authenticated
pub struct ChannelSupervisor {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSupervisor {
    pub fn new(source: Arc<dyn CredentialSource>, transport: Arc<dyn Transport>, config: RealtimeConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                source,
                transport,
                policy: ReconnectPolicy::from(&config),
                config,
                listeners: ListenerRegistry::new(),
                channel: Mutex::new(Channel::default()),
                status,
                events,
                exit: Mutex::new(None),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Start supervising. Returns immediately; progress is reported as events.
    ///
    /// Calling it while already supervising is a no-op.
    pub fn connect(&self) -> RealtimeResult<()> {
        let session_rx = self.shared.source.subscribe();
        if !session_rx.borrow().is_authenticated() {
            return Err(SessionError::NotAuthenticated.into());
        }

        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Real-time channel already supervised");
            return Ok(());
        }

        *self.shared.exit.lock() = None;
        self.shared.set_status(ConnectionStatus::Connecting);
        let shared = self.shared.clone();
        *driver = Some(tokio::spawn(shared.drive(session_rx)));
        Ok(())
    }

    /// Wait until connected, or until supervision stops
    pub async fn wait_connected(&self) -> RealtimeResult<()> {
        let mut status = self.shared.status.subscribe();
        let reached = *status
            .wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Disconnected))
            .await
            .map_err(|_| RealtimeError::Closed)?;
        if reached == ConnectionStatus::Connected {
            return Ok(());
        }
        Err(self
            .shared
            .exit
            .lock()
            .clone()
            .map_or(RealtimeError::NotConnected, Exit::into_error))
    }

    /// Publish an event; dropped with a warning when not connected
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        match self.try_emit(event, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(event, error = %err, "Dropping real-time event");
                false
            }
        }
    }

    pub fn try_emit(&self, event: &str, payload: Value) -> RealtimeResult<()> {
        let sink = self.shared.channel.lock().sink.clone().ok_or(RealtimeError::NotConnected)?;
        sink.send(ClientFrame::Emit {
            event: event.to_string(),
            payload,
        })?;
        Ok(())
    }

    /// Register a handler; every `on` needs a matching `off`
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        let handler: Handler = Arc::new(handler);
        self.shared.listeners.on(event, handler)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.shared.listeners.off(event, id)
    }

    /// Join a room now (when connected) and after every reconnection
    pub fn join_room(&self, room: impl Into<String>) {
        let room = room.into();
        let mut channel = self.shared.channel.lock();
        if !channel.rooms.insert(room.clone()) {
            return;
        }
        if let Some(sink) = &channel.sink {
            if let Err(err) = sink.send(ClientFrame::Join { room: room.clone() }) {
                debug!(room = %room, error = %err, "Join deferred to next connection");
            }
        }
    }

    pub fn leave_room(&self, room: &str) {
        let mut channel = self.shared.channel.lock();
        if !channel.rooms.remove(room) {
            return;
        }
        if let Some(sink) = &channel.sink {
            if let Err(err) = sink.send(ClientFrame::Leave { room: room.to_string() }) {
                warn!(room = %room, error = %err, "Failed to leave real-time room");
            }
        }
    }

    /// Rooms joined explicitly by consumers
    pub fn rooms(&self) -> BTreeSet<String> {
        self.shared.channel.lock().rooms.clone()
    }

    /// Rooms the live connection is in; empty when disconnected
    pub fn joined_rooms(&self) -> BTreeSet<String> {
        let channel = self.shared.channel.lock();
        if channel.sink.is_none() {
            return BTreeSet::new();
        }
        channel
            .session_rooms
            .iter()
            .chain(channel.rooms.iter())
            .cloned()
            .collect()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.shared.listeners.count(event)
    }

    /// Unregister every listener and close the connection
    pub async fn shutdown(&self) {
        self.shared.listeners.clear();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.detach();
        self.shared.channel.lock().rooms.clear();
        *self.shared.exit.lock() = Some(Exit::Shutdown);
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!("Real-time channel shut down");
    }
}

impl Drop for ChannelSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
        self.shared.detach();
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(status = %status, "Real-time status changed");
            self.publish(SupervisorEvent::StatusChanged(status));
        }
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn drive(self: Arc<Self>, mut session_rx: watch::Receiver<SessionSnapshot>) {
        let mut attempts = 0u32;
        // Credential the server refused; never presented again
        let mut rejected: Option<AuthPayload> = None;

        let exit = loop {
            if let Some(stale) = rejected.take() {
                match self.refresh(&stale, &mut session_rx).await {
                    RefreshOutcome::Refreshed => self.set_status(ConnectionStatus::Connecting),
                    RefreshOutcome::Failed(exit) => break exit,
                    RefreshOutcome::Unavailable => {
                        attempts += 1;
                        let exit = self.back_off(attempts, &stale, &mut session_rx).await;
                        rejected = Some(stale);
                        match exit {
                            Some(exit) => break exit,
                            None => continue,
                        }
                    }
                }
            }

            let snapshot = session_rx.borrow_and_update().clone();
            let Some(auth) = AuthPayload::from_snapshot(&snapshot) else {
                break Exit::SignedOut;
            };

            let interrupt = self.run_connection(&auth, &mut attempts, &mut session_rx).await;
            match interrupt {
                Interrupt::SignedOut => break Exit::SignedOut,
                Interrupt::SessionChanged => {
                    info!("Session changed, reconnecting real-time channel");
                    self.set_status(ConnectionStatus::Connecting);
                }
                Interrupt::AuthRejected(message) => {
                    warn!(user_id = %auth.user_id, reason = %message, "Real-time credential rejected");
                    self.set_status(ConnectionStatus::AuthError);
                    attempts += 1;
                    if !self.policy.allows(attempts) {
                        break Exit::Lost { attempts };
                    }
                    rejected = Some(auth);
                }
                Interrupt::Dropped(reason) => {
                    attempts += 1;
                    warn!(attempt = attempts, reason = %reason, "Real-time connection failed");
                    if let Some(exit) = self.back_off(attempts, &auth, &mut session_rx).await {
                        break exit;
                    }
                }
            }
        };

        self.finish(exit);
    }

    /// Handshake, join rooms and pump frames until the connection ends
    async fn run_connection(
        &self,
        auth: &AuthPayload,
        attempts: &mut u32,
        session_rx: &mut watch::Receiver<SessionSnapshot>,
    ) -> Interrupt {
        debug!(user_id = %auth.user_id, tenant_id = %auth.tenant_id, "Opening real-time connection");
        let handshake = tokio::time::timeout(self.config.connection_timeout, self.transport.connect(auth)).await;
        let mut connection = match handshake {
            Ok(Ok(connection)) => connection,
            Ok(Err(TransportError::AuthRejected(message))) => return Interrupt::AuthRejected(message),
            Ok(Err(err)) => return Interrupt::Dropped(err.to_string()),
            Err(_) => return Interrupt::Dropped(TransportError::Timeout.to_string()),
        };

        if let Err(err) = self.attach(auth, connection.sink.clone()) {
            connection.sink.close();
            return Interrupt::Dropped(err.to_string());
        }
        *attempts = 0;
        self.set_status(ConnectionStatus::Connected);
        self.publish(SupervisorEvent::Connected {
            user_id: auth.user_id.clone(),
            tenant_id: auth.tenant_id.clone(),
        });
        info!(user_id = %auth.user_id, tenant_id = %auth.tenant_id, "Real-time channel connected");

        let interrupt = self.pump(&mut connection.incoming, session_rx, auth).await;
        self.detach();
        interrupt
    }

    async fn pump(
        &self,
        incoming: &mut mpsc::UnboundedReceiver<ServerFrame>,
        session_rx: &mut watch::Receiver<SessionSnapshot>,
        auth: &AuthPayload,
    ) -> Interrupt {
        loop {
            tokio::select! {
                frame = incoming.recv() => match frame {
                    Some(ServerFrame::Event { event, payload }) => {
                        let handled = self.listeners.dispatch(&event, &payload);
                        debug!(event = %event, handled, "Real-time event received");
                    }
                    Some(ServerFrame::AuthError { message }) => return Interrupt::AuthRejected(message),
                    None => return Interrupt::Dropped("connection closed by transport".to_string()),
                },
                changed = session_rx.changed() => {
                    if changed.is_err() {
                        return Interrupt::SignedOut;
                    }
                    let snapshot = session_rx.borrow_and_update().clone();
                    match AuthPayload::from_snapshot(&snapshot) {
                        None => return Interrupt::SignedOut,
                        Some(next) if next != *auth => return Interrupt::SessionChanged,
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// Join the session rooms and every explicit room on a new connection
    fn attach(&self, auth: &AuthPayload, sink: Arc<dyn FrameSink>) -> Result<(), TransportError> {
        let mut channel = self.channel.lock();
        let session_rooms = vec![
            format!("{}{}", self.config.personal_room_prefix, auth.user_id),
            format!("{}{}", self.config.tenant_room_prefix, auth.tenant_id),
        ];
        for room in session_rooms.iter().chain(channel.rooms.iter()) {
            sink.send(ClientFrame::Join { room: room.clone() })?;
        }
        channel.session_rooms = session_rooms;
        channel.sink = Some(sink);
        Ok(())
    }

    /// Close the live connection; room membership goes with it
    fn detach(&self) {
        let sink = {
            let mut channel = self.channel.lock();
            channel.session_rooms.clear();
            channel.sink.take()
        };
        if let Some(sink) = sink {
            sink.close();
        }
    }

    /// Obtain a credential other than `rejected`.
    ///
    /// Only a rejected refresh, which ends the session, stops the channel.
    /// Other failures are retried through the backoff.
    async fn refresh(&self, rejected: &AuthPayload, session_rx: &mut watch::Receiver<SessionSnapshot>) -> RefreshOutcome {
        if let Some(outcome) = Self::replacement(&self.source.snapshot(), rejected) {
            return outcome;
        }

        let err = match self.source.refresh_credential().await {
            Ok(credential) => {
                info!(tenant_id = %credential.tenant_id, "Real-time credential refreshed");
                self.publish(SupervisorEvent::AuthRefreshed);
                return RefreshOutcome::Refreshed;
            }
            Err(err) => err,
        };

        match err {
            SessionError::NotAuthenticated | SessionError::TornDown => RefreshOutcome::Failed(Exit::SignedOut),
            err if err.is_superseded() => {
                debug!("Credential refresh superseded, waiting for the newer credential");
                self.await_replacement(rejected, session_rx).await
            }
            err if err.is_auth_failure() && !self.source.snapshot().is_authenticated() => {
                let message = err.to_string();
                warn!(error = %message, "Credential refresh rejected");
                self.publish(SupervisorEvent::AuthFailed {
                    message: message.clone(),
                });
                RefreshOutcome::Failed(Exit::AuthFailed(message))
            }
            err => match Self::replacement(&self.source.snapshot(), rejected) {
                Some(outcome) => outcome,
                None => {
                    warn!(error = %err, "Credential refresh failed, retrying");
                    RefreshOutcome::Unavailable
                }
            },
        }
    }

    /// Decide from the session alone, when it already settles the refresh
    fn replacement(snapshot: &SessionSnapshot, rejected: &AuthPayload) -> Option<RefreshOutcome> {
        match AuthPayload::from_snapshot(snapshot) {
            None => Some(RefreshOutcome::Failed(Exit::SignedOut)),
            Some(current) if current.token != rejected.token => Some(RefreshOutcome::Refreshed),
            Some(_) => None,
        }
    }

    /// Wait for the call that superseded the refresh to publish its credential
    async fn await_replacement(
        &self,
        rejected: &AuthPayload,
        session_rx: &mut watch::Receiver<SessionSnapshot>,
    ) -> RefreshOutcome {
        loop {
            let snapshot = session_rx.borrow_and_update().clone();
            if let Some(outcome) = Self::replacement(&snapshot, rejected) {
                return outcome;
            }
            if snapshot.pending.is_none() {
                // It finished without a new credential
                return RefreshOutcome::Unavailable;
            }
            if session_rx.changed().await.is_err() {
                return RefreshOutcome::Failed(Exit::SignedOut);
            }
        }
    }

    /// Wait out the delay for `attempts`, or give up once they are exhausted.
    ///
    /// Wakes early when the session ends or moves to a credential other than `last`.
    async fn back_off(
        &self,
        attempts: u32,
        last: &AuthPayload,
        session_rx: &mut watch::Receiver<SessionSnapshot>,
    ) -> Option<Exit> {
        if !self.policy.allows(attempts) {
            return Some(Exit::Lost { attempts });
        }
        let delay = self.policy.delay_for_attempt(attempts);
        self.set_status(ConnectionStatus::Reconnecting);
        self.publish(SupervisorEvent::Reconnecting {
            attempt: attempts,
            delay,
        });
        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Waiting before reconnecting");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                changed = session_rx.changed() => {
                    if changed.is_err() {
                        return Some(Exit::SignedOut);
                    }
                    let next = AuthPayload::from_snapshot(&session_rx.borrow_and_update());
                    match next {
                        None => return Some(Exit::SignedOut),
                        Some(next) if next != *last => return None,
                        // Pending markers and the like
                        Some(_) => {}
                    }
                }
            }
        }
    }

    fn finish(&self, exit: Exit) {
        self.detach();
        match &exit {
            Exit::Lost { attempts } => {
                warn!(attempts, "Real-time connection lost, giving up");
                self.publish(SupervisorEvent::ConnectionLost { attempts: *attempts });
            }
            Exit::SignedOut => info!("Session ended, real-time channel disconnected"),
            Exit::AuthFailed(_) | Exit::Shutdown => {}
        }
        *self.exit.lock() = Some(exit);
        self.set_status(ConnectionStatus::Disconnected);
    }
}
