//! # Notification Router
//!
//! Single entry point for notifications from the server push channel (the
//! plugin source) and from the host application.
//!
//! - Only allow-listed methods are routed; everything else is dropped.
//! - Plugin methods arrive namespaced (`Other.LibraryChanged`) with a JSON
//!   array payload whose first element is the data object. Host payloads are
//!   a JSON object.
//! - Events run on one lane per server id, so events for one server are
//!   handled in arrival order while different servers interleave.
//! - Handler errors and panics are logged and never stop a lane.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServiceError};

/// Where a notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationSource {
    /// The server push channel, relayed by the plugin.
    Plugin,
    Host,
}

/// A raw notification as delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub source: NotificationSource,
    pub method: String,
    pub payload: String,
}

impl Notification {
    pub fn plugin(method: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            source: NotificationSource::Plugin,
            method: method.into(),
            payload: payload.into(),
        }
    }

    pub fn host(method: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            source: NotificationSource::Host,
            method: method.into(),
            payload: payload.into(),
        }
    }
}

/// Every method the router accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    ServerOnline,
    ServerUnreachable,
    ServerShuttingDown,
    Unauthorized,
    ServerRestarting,
    ServerConnect,
    AddServer,
    UpdateServer,
    RemoveServer,
    UserDataChanged,
    LibraryChanged,
    SyncLibrary,
    RepairLibrary,
    RemoveLibrary,
    SyncLibrarySelection,
    RepairLibrarySelection,
    AddLibrarySelection,
    RemoveLibrarySelection,
    UserConfigurationUpdated,
    UserPolicyUpdated,
    WebSocketRestarting,
    SystemQuit,
    SystemSleep,
    SystemWake,
    ScreensaverDeactivated,
}

const PLUGIN_METHODS: &[Method] = &[
    Method::ServerUnreachable,
    Method::ServerShuttingDown,
    Method::UserDataChanged,
    Method::ServerConnect,
    Method::LibraryChanged,
    Method::ServerOnline,
    Method::SyncLibrary,
    Method::RepairLibrary,
    Method::RemoveLibrary,
    Method::SyncLibrarySelection,
    Method::RepairLibrarySelection,
    Method::AddLibrarySelection,
    Method::RemoveLibrarySelection,
    Method::AddServer,
    Method::Unauthorized,
    Method::UpdateServer,
    Method::UserConfigurationUpdated,
    Method::ServerRestarting,
    Method::RemoveServer,
    Method::WebSocketRestarting,
    Method::UserPolicyUpdated,
];

const HOST_METHODS: &[Method] = &[
    Method::SystemQuit,
    Method::SystemSleep,
    Method::SystemWake,
    Method::ScreensaverDeactivated,
];

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::ServerOnline => "ServerOnline",
            Method::ServerUnreachable => "ServerUnreachable",
            Method::ServerShuttingDown => "ServerShuttingDown",
            Method::Unauthorized => "Unauthorized",
            Method::ServerRestarting => "ServerRestarting",
            Method::ServerConnect => "ServerConnect",
            Method::AddServer => "AddServer",
            Method::UpdateServer => "UpdateServer",
            Method::RemoveServer => "RemoveServer",
            Method::UserDataChanged => "UserDataChanged",
            Method::LibraryChanged => "LibraryChanged",
            Method::SyncLibrary => "SyncLibrary",
            Method::RepairLibrary => "RepairLibrary",
            Method::RemoveLibrary => "RemoveLibrary",
            Method::SyncLibrarySelection => "SyncLibrarySelection",
            Method::RepairLibrarySelection => "RepairLibrarySelection",
            Method::AddLibrarySelection => "AddLibrarySelection",
            Method::RemoveLibrarySelection => "RemoveLibrarySelection",
            Method::UserConfigurationUpdated => "UserConfigurationUpdated",
            Method::UserPolicyUpdated => "UserPolicyUpdated",
            Method::WebSocketRestarting => "WebSocketRestarting",
            Method::SystemQuit => "System.OnQuit",
            Method::SystemSleep => "System.OnSleep",
            Method::SystemWake => "System.OnWake",
            Method::ScreensaverDeactivated => "GUI.OnScreensaverDeactivated",
        }
    }

    /// Resolve an allow-listed method. Plugin methods lose their namespace.
    pub fn parse(source: NotificationSource, method: &str) -> Option<Method> {
        let (allowed, name) = match source {
            NotificationSource::Plugin => (
                PLUGIN_METHODS,
                method.split_once('.').map_or(method, |(_, name)| name),
            ),
            NotificationSource::Host => (HOST_METHODS, method),
        };
        allowed.iter().copied().find(|m| m.name() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded, allow-listed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub method: Method,
    /// `None` for the default server and for host notifications.
    pub server_id: Option<String>,
    pub data: Map<String, Value>,
}

impl RoutedEvent {
    /// Decode the data object into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| ServiceError::malformed(self.method.name(), e))
    }

    pub fn is_default_server(&self) -> bool {
        self.server_id.is_none()
    }
}

type Handler = Arc<dyn Fn(RoutedEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Method → handler dispatch table.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<Method, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `method`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, method: Method, handler: F)
    where
        F: Fn(RoutedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(method, Arc::new(move |event| handler(event).boxed()));
    }

    pub fn contains(&self, method: Method) -> bool {
        self.handlers.contains_key(&method)
    }

    /// Run the handler for the event. Errors and panics are logged here.
    pub async fn dispatch(&self, event: RoutedEvent) {
        let method = event.method;
        let Some(handler) = self.handlers.get(&method).cloned() else {
            warn!(method = %method, "No handler registered, dropping");
            return;
        };

        let outcome = AssertUnwindSafe(handler(event)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => debug!(method = %method, "Notification handled"),
            Ok(Err(e)) => error!(method = %method, error = %e, "Notification handler failed"),
            Err(_) => error!(
                method = %method,
                error = %ServiceError::HandlerPanicked { method: method.name().to_string() },
                "Notification handler panicked"
            ),
        }
    }
}

/// What happened to a submitted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Not allow-listed.
    Ignored,
    /// Payload could not be decoded.
    Malformed,
    /// The router is shut down.
    Closed,
}

struct Lane {
    sender: mpsc::UnboundedSender<RoutedEvent>,
    task: JoinHandle<()>,
}

pub struct NotificationRouter {
    handlers: Arc<HandlerTable>,
    lanes: Mutex<Option<HashMap<Option<String>, Lane>>>,
    abort: CancellationToken,
}

impl NotificationRouter {
    pub fn new(handlers: HandlerTable, abort: &CancellationToken) -> Self {
        Self {
            handlers: Arc::new(handlers),
            lanes: Mutex::new(Some(HashMap::new())),
            abort: abort.child_token(),
        }
    }

    /// Filter, decode and enqueue a notification on its server's lane.
    pub fn submit(&self, notification: Notification) -> Submission {
        let Some(method) = Method::parse(notification.source, &notification.method) else {
            debug!(method = %notification.method, source = ?notification.source, "Ignoring notification");
            return Submission::Ignored;
        };

        let data = match decode_payload(notification.source, &notification.payload) {
            Ok(data) => data,
            Err(reason) => {
                warn!(method = %method, reason = %reason, "Dropping malformed notification");
                return Submission::Malformed;
            }
        };
        let server_id = data
            .get("ServerId")
            .and_then(Value::as_str)
            .map(str::to_string);

        info!(method = %method, server_id = ?server_id, "Notification received");
        let event = RoutedEvent {
            method,
            server_id,
            data,
        };

        let Ok(mut guard) = self.lanes.lock() else {
            error!("Router lanes poisoned");
            return Submission::Closed;
        };
        let Some(lanes) = guard.as_mut() else {
            return Submission::Closed;
        };

        let key = event.server_id.clone();
        let lane = lanes
            .entry(key.clone())
            .or_insert_with(|| self.spawn_lane(key));
        match lane.sender.send(event) {
            Ok(()) => Submission::Queued,
            Err(_) => Submission::Closed,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes
            .lock()
            .ok()
            .and_then(|lanes| lanes.as_ref().map(HashMap::len))
            .unwrap_or(0)
    }

    /// Stop accepting notifications and wait for queued ones to be handled.
    /// Cancelling the abort token stops the lanes without draining.
    pub async fn shutdown(&self) {
        let lanes = match self.lanes.lock() {
            Ok(mut lanes) => lanes.take().unwrap_or_default(),
            Err(_) => return,
        };

        for (server_id, lane) in lanes {
            drop(lane.sender);
            if let Err(e) = lane.task.await {
                warn!(server_id = ?server_id, error = %e, "Router lane ended abnormally");
            }
        }
        debug!("Notification router shut down");
    }

    fn spawn_lane(&self, server_id: Option<String>) -> Lane {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RoutedEvent>();
        let handlers = self.handlers.clone();
        let abort = self.abort.clone();

        let task = tokio::spawn(async move {
            debug!(server_id = ?server_id, "Router lane started");
            loop {
                tokio::select! {
                    _ = abort.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(event) => handlers.dispatch(event).await,
                        None => break,
                    },
                }
            }
        });

        Lane { sender, task }
    }
}

fn decode_payload(
    source: NotificationSource,
    payload: &str,
) -> std::result::Result<Map<String, Value>, String> {
    let value: Value = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    let data = match source {
        NotificationSource::Plugin => match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            _ => return Err("expected a non-empty JSON array".to_string()),
        },
        NotificationSource::Host => value,
    };

    match data {
        Value::Object(map) => Ok(map),
        // Host notifications without data carry `null`.
        Value::Null => Ok(Map::new()),
        _ => Err("expected a JSON object".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn test_plugin_methods_are_namespaced() {
        assert_eq!(
            Method::parse(NotificationSource::Plugin, "Other.LibraryChanged"),
            Some(Method::LibraryChanged)
        );
        assert_eq!(
            Method::parse(NotificationSource::Plugin, "Other.PatchMusic"),
            None
        );
        assert_eq!(
            Method::parse(NotificationSource::Host, "System.OnSleep"),
            Some(Method::SystemSleep)
        );
        // Host methods are not accepted from the plugin source.
        assert_eq!(
            Method::parse(NotificationSource::Plugin, "System.OnQuit"),
            None
        );
        assert_eq!(Method::parse(NotificationSource::Host, "Other.ServerOnline"), None);
    }

    #[test]
    fn test_decode_payload_shapes() {
        let plugin = decode_payload(NotificationSource::Plugin, r#"[{"Id":"lib"}]"#).unwrap();
        assert_eq!(plugin.get("Id"), Some(&Value::String("lib".to_string())));

        assert!(decode_payload(NotificationSource::Plugin, r#"{"Id":"lib"}"#).is_err());
        assert!(decode_payload(NotificationSource::Plugin, "[]").is_err());
        assert!(decode_payload(NotificationSource::Plugin, "not json").is_err());

        let host = decode_payload(NotificationSource::Host, r#"{"exitcode":0}"#).unwrap();
        assert_eq!(host.len(), 1);
        assert!(decode_payload(NotificationSource::Host, "null").unwrap().is_empty());
        assert!(decode_payload(NotificationSource::Host, "[1]").is_err());
    }

    fn recording_table(log: Arc<AsyncMutex<Vec<String>>>) -> HandlerTable {
        let mut table = HandlerTable::new();
        table.register(Method::SyncLibrary, move |event: RoutedEvent| {
            let log = log.clone();
            async move {
                let id = event
                    .data
                    .get("Id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                // Earlier events sleep longer, so ordering only holds if the
                // lane runs them one at a time.
                let delay = event.data.get("Delay").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().await.push(id);
                Ok(())
            }
        });
        table
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_one_server_keep_arrival_order() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let router = NotificationRouter::new(recording_table(log.clone()), &CancellationToken::new());

        for (id, delay) in [("a1", 30), ("a2", 20), ("a3", 10)] {
            let payload = format!(r#"[{{"ServerId":"A","Id":"{}","Delay":{}}}]"#, id, delay);
            assert_eq!(
                router.submit(Notification::plugin("Other.SyncLibrary", payload)),
                Submission::Queued
            );
        }
        let payload = r#"[{"ServerId":"B","Id":"b1","Delay":1}]"#;
        router.submit(Notification::plugin("Other.SyncLibrary", payload));
        assert_eq!(router.lane_count(), 2);

        router.shutdown().await;

        let log = log.lock().await;
        let lane_a: Vec<&String> = log.iter().filter(|id| id.starts_with('a')).collect();
        assert_eq!(lane_a, ["a1", "a2", "a3"]);
        // Server B was not held up behind server A.
        assert_eq!(log.first().map(String::as_str), Some("b1"));
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_stop_the_lane() {
        let handled = Arc::new(AsyncMutex::new(Vec::new()));
        let mut table = HandlerTable::new();
        table.register(Method::RemoveLibrary, |event: RoutedEvent| async move {
            Err(ServiceError::malformed(event.method.name(), "missing Id"))
        });
        table.register(Method::RepairLibrary, |event: RoutedEvent| async move {
            let id = event.data.get("Id").and_then(Value::as_str).expect("Id present");
            assert!(!id.is_empty());
            Ok(())
        });
        let log = handled.clone();
        table.register(Method::SyncLibrary, move |_event: RoutedEvent| {
            let log = log.clone();
            async move {
                log.lock().await.push("sync");
                Ok(())
            }
        });

        let router = NotificationRouter::new(table, &CancellationToken::new());
        router.submit(Notification::plugin("Other.RemoveLibrary", "[{}]"));
        router.submit(Notification::plugin("Other.RepairLibrary", "[{}]"));
        router.submit(Notification::plugin("Other.SyncLibrary", "[{}]"));
        router.shutdown().await;

        assert_eq!(*handled.lock().await, vec!["sync"]);
    }

    #[tokio::test]
    async fn test_unknown_malformed_and_unhandled_notifications_are_dropped() {
        let router = NotificationRouter::new(HandlerTable::new(), &CancellationToken::new());

        assert_eq!(
            router.submit(Notification::plugin("Other.SetServerSSL", "[{}]")),
            Submission::Ignored
        );
        assert_eq!(
            router.submit(Notification::host("Player.OnPlay", "{}")),
            Submission::Ignored
        );
        assert_eq!(
            router.submit(Notification::plugin("Other.LibraryChanged", "{broken")),
            Submission::Malformed
        );
        assert_eq!(router.lane_count(), 0);

        // Allow-listed but without a handler: queued, then dropped by the lane.
        assert_eq!(
            router.submit(Notification::plugin("Other.AddServer", "[{}]")),
            Submission::Queued
        );
        router.shutdown().await;
        assert_eq!(
            router.submit(Notification::plugin("Other.AddServer", "[{}]")),
            Submission::Closed
        );
    }

    #[test]
    fn test_decode_reports_malformed_payload() {
        #[derive(serde::Deserialize)]
        struct NeedsId {
            #[serde(rename = "Id")]
            _id: String,
        }

        let event = RoutedEvent {
            method: Method::RemoveLibrary,
            server_id: None,
            data: Map::new(),
        };
        match event.decode::<NeedsId>() {
            Err(ServiceError::MalformedPayload { method, .. }) => assert_eq!(method, "RemoveLibrary"),
            _ => panic!("expected a malformed payload error"),
        }
    }
}
