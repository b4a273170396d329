//! Real-time channel following the session end to end

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use switchboard_config::SwitchboardConfig;
use switchboard_rbac::TenantId;
use switchboard_realtime::{ChannelSupervisor, ConnectionStatus, MemoryTransport, SupervisorEvent};
use switchboard_session::testing::{Call, Harness};
use switchboard_session::{IdentityError, Operation};

const PATIENCE: Duration = Duration::from_secs(600);

struct Channel {
    harness: Harness,
    transport: MemoryTransport,
    supervisor: ChannelSupervisor,
}

async fn connected(principal: &str, password: &str) -> Result<Channel> {
    switchboard_logging::init_simple_tracing("warn")?;
    let harness = Harness::acme();
    harness.login(principal, password).await?;

    let backend = harness.backend.clone();
    let transport = MemoryTransport::with_validator(move |auth| backend.is_live(auth.token.expose()));

    let mut config = SwitchboardConfig::default().realtime;
    config.jitter = false;
    let supervisor = ChannelSupervisor::new(harness.manager.clone(), Arc::new(transport.clone()), config);
    supervisor.connect()?;
    supervisor.wait_connected().await?;

    Ok(Channel {
        harness,
        transport,
        supervisor,
    })
}

async fn next_event(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    wanted: impl Fn(&SupervisorEvent) -> bool,
) -> Result<SupervisorEvent> {
    let event = timeout(PATIENCE, async {
        loop {
            let event = events.recv().await?;
            if wanted(&event) {
                return Ok::<_, broadcast::error::RecvError>(event);
            }
        }
    })
    .await??;
    Ok(event)
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_reconnects_with_fresh_credential() -> Result<()> {
    let channel = connected("alice@acme.test", "alice-pw").await?;
    let stale = channel.harness.manager.current_credential().expect("signed in");
    let mut events = channel.supervisor.events();

    channel.transport.expire_sessions();

    next_event(&mut events, |e| *e == SupervisorEvent::StatusChanged(ConnectionStatus::AuthError)).await?;
    next_event(&mut events, |e| *e == SupervisorEvent::AuthRefreshed).await?;
    next_event(&mut events, |e| *e == SupervisorEvent::StatusChanged(ConnectionStatus::Connecting)).await?;
    next_event(&mut events, |e| matches!(e, SupervisorEvent::Connected { .. })).await?;

    let fresh = channel.harness.manager.current_credential().expect("still signed in");
    assert_ne!(fresh.token, stale.token);
    assert_eq!(fresh.tenant_id, stale.tenant_id);
    assert_eq!(channel.harness.backend.call_count(Call::Refresh), 1);

    let handshakes = channel.transport.handshakes();
    assert_eq!(handshakes.last().map(|h| &h.token), Some(&fresh.token));
    assert!(channel.harness.persisted("auth_token").is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_tenant_switch() -> Result<()> {
    let channel = connected("alice@acme.test", "alice-pw").await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.supervisor.on("document.changed", move |payload| {
        let _ = tx.send(payload.clone());
    });
    let mut events = channel.supervisor.events();

    channel.harness.manager.switch_tenant(&TenantId::new("fr")).await?;
    next_event(&mut events, |e| matches!(e, SupervisorEvent::Connected { tenant_id, .. } if tenant_id.as_str() == "fr"))
        .await?;

    assert_eq!(channel.transport.broadcast("tenant:emea", "document.changed", json!({"id": 1})), 0);
    assert_eq!(channel.transport.broadcast("tenant:fr", "document.changed", json!({"id": 2})), 1);
    assert_eq!(timeout(PATIENCE, rx.recv()).await?, Some(json!({"id": 2})));

    assert!(channel.supervisor.emit("document.viewed", json!({"id": 2})));
    assert_eq!(channel.transport.emitted().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_api_call_disconnects_channel() -> Result<()> {
    let channel = connected("bob@acme.test", "bob-pw").await?;

    channel.harness.manager.handle_unauthorized();
    let mut status = channel.supervisor.watch_status();
    timeout(PATIENCE, status.wait_for(|s| *s == ConnectionStatus::Disconnected)).await??;

    assert_eq!(channel.transport.connection_count(), 0);
    assert!(channel.harness.stores_empty());
    assert!(!channel.supervisor.emit("typing", json!({})));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_outage_recovers_within_attempts() -> Result<()> {
    let channel = connected("bob@acme.test", "bob-pw").await?;
    let mut events = channel.supervisor.events();

    channel.transport.refuse_next(3);
    channel.transport.drop_connections();

    let mut delays = Vec::new();
    loop {
        match next_event(&mut events, |_| true).await? {
            SupervisorEvent::Reconnecting { delay, .. } => delays.push(delay),
            SupervisorEvent::Connected { .. } => break,
            _ => {}
        }
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8)
        ]
    );
    assert_eq!(channel.supervisor.status(), ConnectionStatus::Connected);
    assert!(channel.transport.joined_rooms().contains("user:u-bob"));
    Ok(())
}

/// Expire the channel's credential and wait until its refresh is in flight
async fn expire_and_await_refresh(channel: &Channel) -> Result<()> {
    let mut session = channel.harness.manager.subscribe();
    channel.transport.expire_sessions();
    timeout(PATIENCE, session.wait_for(|s| s.pending == Some(Operation::Refresh))).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_outage_backs_off_then_recovers() -> Result<()> {
    let channel = connected("bob@acme.test", "bob-pw").await?;
    let backend = &channel.harness.backend;
    backend.fail_next(Call::Refresh, IdentityError::ServiceUnavailable);
    backend.fail_next(Call::Refresh, IdentityError::Network("connection reset".into()));
    let mut events = channel.supervisor.events();

    channel.transport.expire_sessions();

    let mut delays = Vec::new();
    loop {
        match next_event(&mut events, |_| true).await? {
            SupervisorEvent::Reconnecting { delay, .. } => delays.push(delay),
            SupervisorEvent::Connected { .. } => break,
            other @ (SupervisorEvent::AuthFailed { .. } | SupervisorEvent::ConnectionLost { .. }) => {
                anyhow::bail!("channel gave up: {:?}", other)
            }
            _ => {}
        }
    }

    assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    assert_eq!(backend.call_count(Call::Refresh), 3);
    assert!(channel.harness.manager.snapshot().is_authenticated());
    assert_eq!(channel.supervisor.status(), ConnectionStatus::Connected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_switch_racing_refresh_never_reuses_rejected_token() -> Result<()> {
    let channel = connected("alice@acme.test", "alice-pw").await?;
    let backend = &channel.harness.backend;
    backend.keep_refreshed_tokens();
    backend.delay_next(Call::Refresh, Duration::from_millis(500));
    backend.delay_next(Call::SwitchTenant, Duration::from_millis(2000));
    let stale = channel.harness.manager.current_credential().expect("signed in");
    let mut events = channel.supervisor.events();

    expire_and_await_refresh(&channel).await?;
    // The switch starts after the refresh and finishes long after it
    channel.harness.manager.switch_tenant(&TenantId::new("fr")).await?;

    next_event(&mut events, |e| matches!(e, SupervisorEvent::Connected { tenant_id, .. } if tenant_id.as_str() == "fr"))
        .await?;

    let handshakes = channel.transport.handshakes();
    assert_eq!(handshakes.len(), 2);
    assert_eq!(handshakes.iter().filter(|h| h.token == stale.token).count(), 1);
    assert_eq!(backend.call_count(Call::Refresh), 1);
    assert_eq!(channel.supervisor.status(), ConnectionStatus::Connected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_switch_during_refresh_refreshes_again() -> Result<()> {
    let channel = connected("alice@acme.test", "alice-pw").await?;
    let backend = &channel.harness.backend;
    backend.keep_refreshed_tokens();
    backend.delay_next(Call::Refresh, Duration::from_millis(500));
    backend.delay_next(Call::SwitchTenant, Duration::from_millis(2000));
    backend.fail_next(Call::SwitchTenant, IdentityError::ServiceUnavailable);
    let stale = channel.harness.manager.current_credential().expect("signed in");
    let mut events = channel.supervisor.events();

    expire_and_await_refresh(&channel).await?;
    let switched = channel.harness.manager.switch_tenant(&TenantId::new("fr")).await;
    assert!(switched.is_err_and(|err| err.is_connectivity()));

    let connected = next_event(&mut events, |e| matches!(e, SupervisorEvent::Connected { .. })).await?;
    assert!(matches!(connected, SupervisorEvent::Connected { tenant_id, .. } if tenant_id.as_str() == "emea"));

    let handshakes = channel.transport.handshakes();
    assert_eq!(handshakes.iter().filter(|h| h.token == stale.token).count(), 1);
    assert_eq!(backend.call_count(Call::Refresh), 2);
    assert_eq!(
        handshakes.last().map(|h| &h.token),
        channel.harness.manager.current_credential().as_ref().map(|c| &c.token)
    );
    Ok(())
}
