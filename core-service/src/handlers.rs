//! Notification handlers: one async function per routed method, wired into
//! the router's dispatch table by [`ServiceHandlers::into_table`].

use std::future::Future;
use std::sync::Arc;

use bridge_traits::{HostApplication, MediaServer, NotificationLevel};
use core_auth::ConnectionSupervisor;
use core_sync::{split_library_ids, SelectionAction, SyncOrchestrator, UserDataChange};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::context::HandlerSignals;
use crate::error::{Result, ServiceError};
use crate::router::{HandlerTable, Method, RoutedEvent};

#[derive(Debug, Deserialize)]
struct IdPayload {
    #[serde(rename = "Id", default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncLibraryPayload {
    #[serde(rename = "Id", default)]
    id: Option<String>,
    #[serde(rename = "Update", default)]
    update: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LibraryChangedPayload {
    items_updated: Vec<String>,
    items_added: Vec<String>,
    items_removed: Vec<String>,
    #[serde(default)]
    items_verify: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserDataPayload {
    #[serde(default)]
    user_id: Option<String>,
    user_data_list: Vec<UserDataChange>,
}

/// Ids from a required, comma separated `Id` field.
fn required_ids(event: &RoutedEvent) -> Result<Vec<String>> {
    let payload: IdPayload = event.decode()?;
    let ids = payload
        .id
        .as_deref()
        .map(split_library_ids)
        .unwrap_or_default();
    if ids.is_empty() {
        return Err(ServiceError::malformed(event.method.name(), "missing Id"));
    }
    Ok(ids)
}

pub struct ServiceHandlers {
    supervisor: ConnectionSupervisor,
    sync: Arc<SyncOrchestrator>,
    server: Arc<dyn MediaServer>,
    host: Arc<dyn HostApplication>,
    device_id: String,
    signals: HandlerSignals,
}

impl ServiceHandlers {
    pub fn new(
        supervisor: ConnectionSupervisor,
        sync: Arc<SyncOrchestrator>,
        server: Arc<dyn MediaServer>,
        host: Arc<dyn HostApplication>,
        device_id: impl Into<String>,
        signals: HandlerSignals,
    ) -> Self {
        Self {
            supervisor,
            sync,
            server,
            host,
            device_id: device_id.into(),
            signals,
        }
    }

    /// Build the dispatch table for every handled method.
    ///
    /// `AddServer` is routed but has no handler: adding a server is an
    /// interactive flow owned by the host.
    pub fn into_table(self) -> HandlerTable {
        let this = Arc::new(self);
        let mut table = HandlerTable::new();

        route(&mut table, &this, Method::ServerOnline, Self::server_online);
        route(&mut table, &this, Method::ServerUnreachable, Self::server_lost);
        route(&mut table, &this, Method::ServerShuttingDown, Self::server_lost);
        route(&mut table, &this, Method::Unauthorized, Self::unauthorized);
        route(&mut table, &this, Method::ServerRestarting, Self::server_restarting);
        route(&mut table, &this, Method::ServerConnect, Self::server_connect);
        route(&mut table, &this, Method::UpdateServer, Self::update_server);
        route(&mut table, &this, Method::RemoveServer, Self::remove_server);
        route(&mut table, &this, Method::UserDataChanged, Self::user_data_changed);
        route(&mut table, &this, Method::LibraryChanged, Self::library_changed);
        route(&mut table, &this, Method::SyncLibrary, Self::sync_library);
        route(&mut table, &this, Method::RepairLibrary, Self::repair_library);
        route(&mut table, &this, Method::RemoveLibrary, Self::remove_library);
        for method in [
            Method::SyncLibrarySelection,
            Method::RepairLibrarySelection,
            Method::AddLibrarySelection,
            Method::RemoveLibrarySelection,
        ] {
            route(&mut table, &this, method, Self::library_selection);
        }
        route(&mut table, &this, Method::UserConfigurationUpdated, Self::views_changed);
        route(&mut table, &this, Method::UserPolicyUpdated, Self::views_changed);
        route(&mut table, &this, Method::WebSocketRestarting, Self::fast_sync);
        route(&mut table, &this, Method::ScreensaverDeactivated, Self::fast_sync);
        route(&mut table, &this, Method::SystemQuit, Self::quit);
        route(&mut table, &this, Method::SystemSleep, Self::sleep);
        route(&mut table, &this, Method::SystemWake, Self::wake);

        table
    }

    async fn server_online(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        self.supervisor.on_online(event.server_id.as_deref()).await;
        if !event.is_default_server() {
            return Ok(());
        }

        match self.server.get_device(&self.device_id).await {
            Ok(device) => {
                let message = format!("Connected as {}", device.name);
                self.host
                    .notify("Server online", &message, NotificationLevel::Info)
                    .await?;
            }
            Err(e) => warn!(error = %e, "Could not read device registration"),
        }
        Ok(())
    }

    async fn server_lost(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        let server_id = event.server_id.as_deref();
        match event.method {
            Method::ServerShuttingDown => self.supervisor.on_server_shutting_down(server_id).await,
            _ => self.supervisor.on_unreachable(server_id).await,
        }
        Ok(())
    }

    async fn unauthorized(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        self.supervisor
            .on_unauthorized(event.server_id.as_deref())
            .await;
        Ok(())
    }

    async fn server_restarting(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        self.supervisor
            .on_server_restarting(event.server_id.as_deref())
            .await;
        Ok(())
    }

    async fn server_connect(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        for id in required_ids(&event)? {
            self.supervisor.connect_server(&id).await?;
        }
        Ok(())
    }

    async fn update_server(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        self.supervisor
            .update_server(event.server_id.as_deref())
            .await;
        Ok(())
    }

    async fn remove_server(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        for id in required_ids(&event)? {
            self.supervisor.remove_server(&id).await?;
        }
        Ok(())
    }

    async fn user_data_changed(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        if !event.is_default_server() || !self.sync.is_started().await {
            return Ok(());
        }
        let payload: UserDataPayload = event.decode()?;
        self.sync
            .userdata(payload.user_id.as_deref(), payload.user_data_list)
            .await?;
        Ok(())
    }

    async fn library_changed(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        if !event.is_default_server() || !self.sync.is_started().await {
            debug!("Library change ignored while sync is not running");
            return Ok(());
        }
        let payload: LibraryChangedPayload = event.decode()?;
        info!(
            updated = payload.items_updated.len(),
            added = payload.items_added.len(),
            removed = payload.items_removed.len(),
            verify = payload.items_verify.len(),
            "Library changed"
        );

        let mut changed = payload.items_updated;
        changed.extend(payload.items_added);
        self.sync.updated(changed).await?;
        self.sync.removed(payload.items_removed).await?;
        self.sync.delay_verify(payload.items_verify).await;
        Ok(())
    }

    async fn sync_library(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        let payload: SyncLibraryPayload = event.decode()?;
        let Some(ids) = payload.id.as_deref().map(split_library_ids) else {
            return Ok(());
        };
        for id in ids {
            self.sync.add_library(&id, payload.update).await?;
        }
        Ok(())
    }

    async fn repair_library(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        let ids = required_ids(&event)?;
        self.sync
            .select_libraries(SelectionAction::Repair, ids)
            .await?;
        Ok(())
    }

    async fn remove_library(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        let ids = required_ids(&event)?;
        self.sync
            .select_libraries(SelectionAction::Remove, ids)
            .await?;
        Ok(())
    }

    async fn library_selection(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        let action = SelectionAction::from_method(event.method.name()).ok_or_else(|| {
            ServiceError::malformed(event.method.name(), "not a selection method")
        })?;
        let payload: IdPayload = event.decode()?;
        let ids = payload
            .id
            .as_deref()
            .map(split_library_ids)
            .unwrap_or_default();
        self.sync.select_libraries(action, ids).await?;
        Ok(())
    }

    async fn views_changed(self: Arc<Self>, event: RoutedEvent) -> Result<()> {
        if !event.is_default_server() || !self.sync.is_started().await {
            return Ok(());
        }
        self.sync.refresh_views().await?;
        Ok(())
    }

    async fn fast_sync(self: Arc<Self>, _event: RoutedEvent) -> Result<()> {
        if self.sync.is_started().await {
            self.sync.fast_sync().await?;
        }
        Ok(())
    }

    async fn quit(self: Arc<Self>, _event: RoutedEvent) -> Result<()> {
        info!("Host is quitting");
        self.signals.request_quit();
        Ok(())
    }

    async fn sleep(self: Arc<Self>, _event: RoutedEvent) -> Result<()> {
        info!("Host going to sleep");
        self.signals.request_stop();
        self.supervisor.suspend().await;
        Ok(())
    }

    async fn wake(self: Arc<Self>, _event: RoutedEvent) -> Result<()> {
        if self.supervisor.resume().await {
            info!("Host woke up");
            self.signals.clear_stop();
            self.supervisor.register(None).await;
        }
        Ok(())
    }
}

fn route<F, Fut>(
    table: &mut HandlerTable,
    handlers: &Arc<ServiceHandlers>,
    method: Method,
    handler: F,
) where
    F: Fn(Arc<ServiceHandlers>, RoutedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handlers = handlers.clone();
    table.register(method, move |event| handler(handlers.clone(), event));
}
