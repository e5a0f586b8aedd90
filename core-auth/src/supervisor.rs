//! # Connection Supervisor
//!
//! Owns the connection lifecycle of every known server:
//!
//! ```text
//! SignedOut -> Connecting -> { SignedIn | Unreachable | Unauthorized }
//! SignedIn  -> Unreachable            (connectivity loss)
//! any       -> Connecting             (retry)
//! ```
//!
//! At most one connection attempt runs per server. Attempts are spawned tasks
//! tracked in an in-flight table; a second request for the same server while
//! one is in flight is a no-op, which is what keeps bursts of identical
//! notifications from turning into retry storms.
//!
//! Retry policy:
//!
//! - unreachable and shutting down: flat [`RetryPolicy::unreachable_delay`],
//!   repeated until the attempt succeeds or is cancelled
//! - unauthorized: one [`RetryPolicy::unauthorized_delay`] retry per
//!   `auth_check` window; the window reopens when the default server comes
//!   online or signs in
//!
//! Every state change is published as
//! [`ConnectionEvent::StateChanged`](core_runtime::events::ConnectionEvent).
//! The supervisor never touches library data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{
    ConnectionOutcome, HostApplication, NotificationLevel, ServerConnector, SignedInSession,
};
use core_runtime::config::{ServiceConfig, ServiceTimings};
use core_runtime::events::{ConnectionEvent, CoreEvent, EventBus};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::credentials::CredentialStore;
use crate::error::{ConnectionError, Result};
use crate::types::{ConnectionState, ServerSlot};

const NOTIFY_HEADING: &str = "Media Server";

/// Delays applied between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub unreachable_delay: Duration,
    pub unauthorized_delay: Duration,
    /// Wait after host wake before reconnecting, so the network can come up.
    pub wake_settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unreachable_delay: Duration::from_secs(20),
            unauthorized_delay: Duration::from_secs(120),
            wake_settle_delay: Duration::from_secs(10),
        }
    }
}

impl From<&ServiceTimings> for RetryPolicy {
    fn from(timings: &ServiceTimings) -> Self {
        Self {
            unreachable_delay: timings.unreachable_retry_delay,
            unauthorized_delay: timings.unauthorized_retry_delay,
            wake_settle_delay: timings.wake_settle_delay,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ServerEntry {
    state: ConnectionState,
    session: Option<SignedInSession>,
    /// The connector holds an open client for this server.
    open: bool,
}

struct Attempt {
    generation: u64,
    cancel: CancellationToken,
}

struct SupervisorState {
    servers: HashMap<ServerSlot, ServerEntry>,
    attempts: HashMap<ServerSlot, Attempt>,
    next_generation: u64,
    /// An unauthorized retry may still be scheduled in this window.
    auth_check: bool,
    /// The next default-server outage notifies the user.
    warn: bool,
    suspended: bool,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            servers: HashMap::new(),
            attempts: HashMap::new(),
            next_generation: 0,
            auth_check: true,
            warn: true,
            suspended: false,
        }
    }
}

struct Shared {
    connector: Arc<dyn ServerConnector>,
    host: Arc<dyn HostApplication>,
    credentials: Arc<CredentialStore>,
    events: EventBus,
    policy: RetryPolicy,
    abort: CancellationToken,
    state: Mutex<SupervisorState>,
}

/// Supervises connections to the default server and any named servers.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    /// `abort` is the service-wide cancellation signal; attempts and waits
    /// observe a child of it.
    pub fn new(
        connector: Arc<dyn ServerConnector>,
        host: Arc<dyn HostApplication>,
        credentials: Arc<CredentialStore>,
        events: EventBus,
        policy: RetryPolicy,
        abort: &CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                host,
                credentials,
                events,
                policy,
                abort: abort.child_token(),
                state: Mutex::new(SupervisorState::default()),
            }),
        }
    }

    pub fn from_config(config: &ServiceConfig, events: EventBus, abort: &CancellationToken) -> Self {
        let credentials = Arc::new(CredentialStore::new(
            config.credentials_path(),
            config.legacy_credentials_path(),
        ));
        Self::new(
            config.server_connector.clone(),
            config.host.clone(),
            credentials,
            events,
            RetryPolicy::from(&config.timings),
            abort,
        )
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.shared.credentials
    }

    /// Start a connection attempt now. Returns `false` if one is already in
    /// flight for this server, or while suspended or shut down.
    #[instrument(skip(self))]
    pub async fn register(&self, server_id: Option<&str>) -> bool {
        self.schedule(ServerSlot::from_id(server_id), None).await
    }

    pub async fn state(&self, server_id: Option<&str>) -> ConnectionState {
        let state = self.shared.state.lock().await;
        state
            .servers
            .get(&ServerSlot::from_id(server_id))
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub async fn session(&self, server_id: Option<&str>) -> Option<SignedInSession> {
        let state = self.shared.state.lock().await;
        state
            .servers
            .get(&ServerSlot::from_id(server_id))
            .and_then(|entry| entry.session.clone())
    }

    /// The signed-in session, or the reason there is none.
    pub async fn require_session(&self, server_id: Option<&str>) -> Result<SignedInSession> {
        let slot = ServerSlot::from_id(server_id);
        let state = self.shared.state.lock().await;
        let entry = state.servers.get(&slot).cloned().unwrap_or_default();
        let server = slot.to_string();
        match (entry.state, entry.session) {
            (ConnectionState::SignedIn, Some(session)) => Ok(session),
            (ConnectionState::Unreachable, _) => Err(ConnectionError::Unreachable { server }),
            (ConnectionState::Unauthorized, _) => Err(ConnectionError::Unauthorized { server }),
            _ => Err(ConnectionError::NotSignedIn { server }),
        }
    }

    pub async fn attempt_in_flight(&self, server_id: Option<&str>) -> bool {
        let state = self.shared.state.lock().await;
        state.attempts.contains_key(&ServerSlot::from_id(server_id))
    }

    /// The server announced itself online.
    pub async fn on_online(&self, server_id: Option<&str>) {
        if server_id.is_some() {
            return;
        }
        let mut state = self.shared.state.lock().await;
        state.auth_check = true;
        state.warn = true;
        info!("Default server online");
    }

    /// The server stopped answering.
    pub async fn on_unreachable(&self, server_id: Option<&str>) {
        self.lost_connection(server_id, "Server is unreachable").await;
    }

    /// The server announced it is shutting down.
    pub async fn on_server_shutting_down(&self, server_id: Option<&str>) {
        self.lost_connection(server_id, "Server is shutting down").await;
    }

    /// The server rejected the stored credentials.
    pub async fn on_unauthorized(&self, server_id: Option<&str>) {
        self.shared
            .notify("Server rejected the stored credentials", NotificationLevel::Error)
            .await;

        if server_id.is_some() {
            return;
        }
        self.shared
            .transition(&ServerSlot::Default, ConnectionState::Unauthorized)
            .await;

        if self.shared.take_auth_check().await {
            self.schedule(ServerSlot::Default, Some(self.shared.policy.unauthorized_delay))
                .await;
        } else {
            debug!("Unauthorized retry already used in this window");
        }
    }

    /// The server announced a restart.
    pub async fn on_server_restarting(&self, server_id: Option<&str>) {
        if server_id.is_some() {
            return;
        }
        self.shared
            .notify("Server is restarting", NotificationLevel::Info)
            .await;
        self.schedule(ServerSlot::Default, Some(self.shared.policy.unreachable_delay))
            .await;
    }

    /// Remember an additional server and connect to it.
    #[instrument(skip(self))]
    pub async fn connect_server(&self, id: &str) -> Result<bool> {
        self.shared.credentials.add_server(id).await?;
        Ok(self.register(Some(id)).await)
    }

    /// Reconnect a server whose details changed, replacing any in-flight
    /// attempt.
    #[instrument(skip(self))]
    pub async fn update_server(&self, server_id: Option<&str>) -> bool {
        let slot = ServerSlot::from_id(server_id);
        self.shared.cancel_attempt(&slot).await;
        self.schedule(slot, None).await
    }

    /// Forget a named server: cancel attempts, close its connection and drop
    /// it from the credentials file.
    #[instrument(skip(self))]
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let slot = ServerSlot::from_id(Some(id));
        self.shared.cancel_attempt(&slot).await;

        if let Err(e) = self.shared.connector.close(Some(id)).await {
            warn!(server_id = %id, error = %e, "Failed to close server connection");
        }
        self.shared.credentials.remove_server(id).await?;

        let mut state = self.shared.state.lock().await;
        if let Some(entry) = state.servers.remove(&slot) {
            self.shared
                .publish(&slot, entry.state, ConnectionState::SignedOut);
        }
        info!(server_id = %id, "Server removed");
        Ok(())
    }

    /// Host is going to sleep: cancel attempts and close every connection.
    #[instrument(skip(self))]
    pub async fn suspend(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.suspended = true;
            for (_, attempt) in state.attempts.drain() {
                attempt.cancel.cancel();
            }
        }
        self.shared.close_everything().await;
        info!("Connections suspended");
    }

    /// Host woke up. Ignored unless suspended; otherwise waits for the
    /// network to settle and accepts attempts again. Returns whether the
    /// caller should re-register its servers.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> bool {
        if !self.shared.state.lock().await.suspended {
            warn!("Wake without a preceding sleep, ignoring");
            return false;
        }

        if !sleep_or_cancel(self.shared.policy.wake_settle_delay, &self.shared.abort).await {
            return false;
        }

        self.shared.state.lock().await.suspended = false;
        info!("Connections resumed");
        true
    }

    /// Cancel everything and close all connections. The supervisor accepts no
    /// further attempts.
    pub async fn shutdown(&self) {
        self.shared.abort.cancel();
        self.shared.state.lock().await.attempts.clear();
        self.shared.close_everything().await;
        info!("Connection supervisor shut down");
    }

    async fn lost_connection(&self, server_id: Option<&str>, message: &str) {
        self.shared.warn_outage(server_id, message).await;

        if server_id.is_none() {
            self.shared
                .transition(&ServerSlot::Default, ConnectionState::Unreachable)
                .await;
            self.schedule(ServerSlot::Default, Some(self.shared.policy.unreachable_delay))
                .await;
        }
    }

    async fn schedule(&self, slot: ServerSlot, delay: Option<Duration>) -> bool {
        let (generation, cancel) = {
            let mut state = self.shared.state.lock().await;
            if self.shared.abort.is_cancelled() || state.suspended {
                debug!(server = %slot, "Not scheduling connection attempt");
                return false;
            }
            if state.attempts.contains_key(&slot) {
                debug!(server = %slot, "Connection attempt already in flight");
                return false;
            }

            state.next_generation += 1;
            let generation = state.next_generation;
            let cancel = self.shared.abort.child_token();
            state.attempts.insert(
                slot.clone(),
                Attempt {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            (generation, cancel)
        };

        debug!(server = %slot, ?delay, generation, "Scheduling connection attempt");
        tokio::spawn(run_attempt(
            self.shared.clone(),
            slot,
            delay,
            generation,
            cancel,
        ));
        true
    }
}

async fn run_attempt(
    shared: Arc<Shared>,
    slot: ServerSlot,
    mut delay: Option<Duration>,
    generation: u64,
    cancel: CancellationToken,
) {
    shared.teardown(&slot).await;

    loop {
        if let Some(wait) = delay.take() {
            if !sleep_or_cancel(wait, &cancel).await {
                break;
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        shared.transition(&slot, ConnectionState::Connecting).await;
        let outcome = tokio::select! {
            outcome = shared.connector.connect(slot.id()) => outcome,
            _ = cancel.cancelled() => break,
        };

        match outcome {
            Ok(ConnectionOutcome::SignedIn(session)) => {
                shared.signed_in(&slot, session).await;
                break;
            }
            Ok(ConnectionOutcome::Unreachable) => {
                shared.transition(&slot, ConnectionState::Unreachable).await;
                shared
                    .warn_outage(slot.id(), "Server is unreachable")
                    .await;
                delay = Some(shared.policy.unreachable_delay);
            }
            Ok(ConnectionOutcome::Unauthorized) => {
                shared.transition(&slot, ConnectionState::Unauthorized).await;
                if slot.is_default() && shared.take_auth_check().await {
                    delay = Some(shared.policy.unauthorized_delay);
                } else {
                    break;
                }
            }
            Err(e) => {
                warn!(server = %slot, error = %e, "Connection attempt failed");
                shared.transition(&slot, ConnectionState::Unreachable).await;
                delay = Some(shared.policy.unreachable_delay);
            }
        }
    }

    let mut state = shared.state.lock().await;
    if state.attempts.get(&slot).map(|a| a.generation) == Some(generation) {
        state.attempts.remove(&slot);
    }
}

impl Shared {
    /// Close the server's client if one is open. A signed-in server moves to
    /// `SignedOut` first so dependants stop using it.
    async fn teardown(&self, slot: &ServerSlot) {
        let open = {
            let mut state = self.state.lock().await;
            let entry = state.servers.entry(slot.clone()).or_default();
            let open = entry.open;
            entry.open = false;
            entry.session = None;
            if entry.state == ConnectionState::SignedIn {
                entry.state = ConnectionState::SignedOut;
                self.publish(slot, ConnectionState::SignedIn, ConnectionState::SignedOut);
            }
            open
        };

        if open {
            debug!(server = %slot, "Closing existing connection before reconnecting");
            if let Err(e) = self.connector.close(slot.id()).await {
                warn!(server = %slot, error = %e, "Failed to close connection");
            }
        }
    }

    async fn transition(&self, slot: &ServerSlot, to: ConnectionState) {
        let mut state = self.state.lock().await;
        let entry = state.servers.entry(slot.clone()).or_default();
        let from = entry.state;
        if from != to {
            entry.state = to;
            self.publish(slot, from, to);
        }
    }

    async fn signed_in(&self, slot: &ServerSlot, session: SignedInSession) {
        let mut state = self.state.lock().await;
        if slot.is_default() {
            state.auth_check = true;
            state.warn = true;
        }

        let entry = state.servers.entry(slot.clone()).or_default();
        let from = entry.state;
        entry.state = ConnectionState::SignedIn;
        entry.open = true;
        entry.session = Some(session.clone());
        self.publish(slot, from, ConnectionState::SignedIn);

        info!(server = %slot, user_id = %session.user_id, "Signed in");
        let _ = self.events.emit(CoreEvent::Connection(ConnectionEvent::SessionEstablished {
            server_id: slot.id().map(str::to_string),
            user_id: session.user_id,
        }));
    }

    fn publish(&self, slot: &ServerSlot, from: ConnectionState, to: ConnectionState) {
        if from == to {
            return;
        }
        debug!(server = %slot, %from, %to, "Connection state changed");
        let _ = self.events.emit(CoreEvent::Connection(ConnectionEvent::StateChanged {
            server_id: slot.id().map(str::to_string),
            from,
            to,
        }));
    }

    async fn take_auth_check(&self) -> bool {
        let mut state = self.state.lock().await;
        std::mem::replace(&mut state.auth_check, false)
    }

    async fn cancel_attempt(&self, slot: &ServerSlot) {
        if let Some(attempt) = self.state.lock().await.attempts.remove(slot) {
            attempt.cancel.cancel();
        }
    }

    /// Notify the user about an outage. Default-server outages notify once
    /// until the server is seen online again.
    async fn warn_outage(&self, server_id: Option<&str>, message: &str) {
        let should_warn = {
            let mut state = self.state.lock().await;
            let should_warn = state.warn || server_id.is_some();
            if should_warn {
                state.warn = server_id.is_some();
            }
            should_warn
        };

        if should_warn {
            let message = match server_id {
                Some(id) => format!("{} ({})", message, id),
                None => message.to_string(),
            };
            self.notify(&message, NotificationLevel::Error).await;
        }
    }

    async fn notify(&self, message: &str, level: NotificationLevel) {
        if let Err(e) = self.host.notify(NOTIFY_HEADING, message, level).await {
            warn!(error = %e, "Failed to show notification");
        }
    }

    async fn close_everything(&self) {
        {
            let mut state = self.state.lock().await;
            let slots: Vec<ServerSlot> = state.servers.keys().cloned().collect();
            for slot in slots {
                if let Some(entry) = state.servers.get_mut(&slot) {
                    let from = entry.state;
                    entry.state = ConnectionState::SignedOut;
                    entry.session = None;
                    entry.open = false;
                    self.publish(&slot, from, ConnectionState::SignedOut);
                }
            }
        }

        if let Err(e) = self.connector.close_all().await {
            warn!(error = %e, "Failed to close connections");
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns whether the full delay
/// elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
