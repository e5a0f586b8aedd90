//! # Sync Orchestrator
//!
//! Mirrors selected server libraries into the local catalog.
//!
//! ## Batches
//!
//! Every public operation runs as one batch:
//!
//! - `add_library` pages through a library, one catalog session per page,
//!   then advances the library's RestorePoint in the checkpoint file
//! - `updated`, `removed` and `userdata` apply incremental changes in a
//!   single catalog session, holding the lock of every library involved
//! - `process_verify_queue` resolves deferred existence checks
//!
//! Catalog writes happen only while holding the `catalog` [`ProcessLock`].
//! Every batch touching known libraries additionally holds
//! `sync.<library id>` for each of them, so no two batches for one library
//! overlap across instances. The RestorePoint save is
//! the commit point of a full sync: a batch interrupted before it leaves the
//! RestorePoint untouched and the library listed as pending, and re-running
//! it converges on the same catalog because every write is an upsert.
//!
//! A batch that cannot get a lock within [`SyncConfig::catalog_lock_wait`] is
//! queued for a single pass of [`SyncOrchestrator::retry_pending`]. Any other
//! failure aborts that batch only.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{Clock, MediaServer, SharedFlagStore};
use core_library::{
    CatalogItem, DataStore, LibraryView, LockConfig, ProcessLock, Session, SessionMode, StoreError,
    CATALOG,
};
use core_runtime::config::ServiceConfig;
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent};
use core_runtime::FlagReader;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::{CheckpointFile, SyncCheckpoint, DATE_FORMAT};
use crate::error::{Result, SyncError};
use crate::selection::SelectionAction;
use crate::verify::VerifyQueue;

/// Library id used in events for batches spanning several libraries.
pub const ALL_LIBRARIES: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Items requested per page during a full sync.
    pub page_size: usize,
    pub catalog_lock_wait: Duration,
    pub verify_delay: Duration,
    pub lock: LockConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            catalog_lock_wait: Duration::from_secs(30),
            verify_delay: Duration::from_secs(60),
            lock: LockConfig::default(),
        }
    }
}

impl From<&ServiceConfig> for SyncConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            page_size: config.page_size,
            catalog_lock_wait: config.timings.catalog_lock_wait,
            verify_delay: config.timings.verify_delay,
            lock: LockConfig {
                initial_delay: config.timings.lock_initial_delay,
                max_delay: config.timings.lock_max_delay,
            },
        }
    }
}

/// One entry of a `UserDataChanged` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDataChange {
    #[serde(rename = "ItemId")]
    pub item_id: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed { upserted: u64, removed: u64 },
    /// Lock contention; queued for the retry pass.
    Queued,
    /// Nothing to do, or the service is stopping.
    Skipped,
}

#[derive(Debug, Clone)]
enum SyncRequest {
    AddLibrary { library_id: String, update: bool },
    RemoveLibrary(String),
    Updated(Vec<String>),
    Removed(Vec<String>),
    UserData(Vec<UserDataChange>),
    Verify(Vec<String>),
}

impl SyncRequest {
    fn library_id(&self) -> &str {
        match self {
            SyncRequest::AddLibrary { library_id, .. } | SyncRequest::RemoveLibrary(library_id) => {
                library_id
            }
            _ => ALL_LIBRARIES,
        }
    }
}

struct SyncState {
    started: bool,
    user_id: Option<String>,
    checkpoint: SyncCheckpoint,
    pending: VecDeque<SyncRequest>,
    verify: VerifyQueue,
}

/// Collaborators shared with the rest of the service.
#[derive(Clone)]
pub struct SyncDeps {
    pub store: DataStore,
    pub flags: Arc<dyn SharedFlagStore>,
    pub server: Arc<dyn MediaServer>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
}

pub struct SyncOrchestrator {
    deps: SyncDeps,
    checkpoint_file: CheckpointFile,
    config: SyncConfig,
    should_stop: FlagReader,
    abort: CancellationToken,
    state: Mutex<SyncState>,
    active_batches: AtomicUsize,
    idle: Notify,
}

/// Counts a running batch for [`SyncOrchestrator::drain`].
struct BatchGuard<'a>(&'a SyncOrchestrator);

impl<'a> BatchGuard<'a> {
    fn enter(orchestrator: &'a SyncOrchestrator) -> Self {
        orchestrator.active_batches.fetch_add(1, Ordering::SeqCst);
        Self(orchestrator)
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.active_batches.fetch_sub(1, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }
}

impl SyncOrchestrator {
    pub fn new(
        deps: SyncDeps,
        checkpoint_file: CheckpointFile,
        config: SyncConfig,
        should_stop: FlagReader,
        abort: CancellationToken,
    ) -> Self {
        Self {
            deps,
            checkpoint_file,
            state: Mutex::new(SyncState {
                started: false,
                user_id: None,
                checkpoint: SyncCheckpoint::default(),
                pending: VecDeque::new(),
                verify: VerifyQueue::new(config.verify_delay),
            }),
            config,
            should_stop,
            abort,
            active_batches: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Load the checkpoint and accept work for the signed-in `user_id`.
    #[instrument(skip(self))]
    pub async fn start(&self, user_id: &str) {
        let checkpoint = self.checkpoint_file.load().await;
        let mut state = self.state.lock().await;
        info!(
            selected = checkpoint.whitelist.len(),
            pending = checkpoint.libraries.len(),
            "Library sync started"
        );
        state.checkpoint = checkpoint;
        state.user_id = Some(user_id.to_string());
        state.started = true;
    }

    /// Stop accepting work. Running batches finish their current page.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.started {
            info!(dropped_retries = state.pending.len(), "Library sync stopped");
        }
        state.started = false;
        state.user_id = None;
        state.pending.clear();
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    pub async fn user_id(&self) -> Option<String> {
        self.state.lock().await.user_id.clone()
    }

    pub async fn selected_libraries(&self) -> Vec<String> {
        self.state.lock().await.checkpoint.whitelist.clone()
    }

    pub async fn restore_point(&self, library_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.checkpoint.restore_point.get(library_id).cloned()
    }

    pub async fn pending_retries(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn verify_backlog(&self) -> usize {
        self.state.lock().await.verify.len()
    }

    pub fn is_syncing(&self) -> bool {
        self.active_batches.load(Ordering::SeqCst) > 0
    }

    /// Wait for running batches to finish. Returns `false` if some are still
    /// running after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            if !self.is_syncing() {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return !self.is_syncing();
            }
        }
    }

    /// Full sync of one library, or an incremental pass from its RestorePoint
    /// when `update` is set.
    #[instrument(skip(self))]
    pub async fn add_library(&self, library_id: &str, update: bool) -> Result<BatchOutcome> {
        self.execute(
            SyncRequest::AddLibrary {
                library_id: library_id.to_string(),
                update,
            },
            true,
        )
        .await
    }

    /// Drop a library from the catalog and the selection.
    #[instrument(skip(self))]
    pub async fn remove_library(&self, library_id: &str) -> Result<BatchOutcome> {
        self.execute(SyncRequest::RemoveLibrary(library_id.to_string()), true)
            .await
    }

    /// Upsert changed items of selected libraries.
    #[instrument(skip(self, item_ids), fields(count = item_ids.len()))]
    pub async fn updated(&self, item_ids: Vec<String>) -> Result<BatchOutcome> {
        if item_ids.is_empty() {
            return Ok(BatchOutcome::Skipped);
        }
        self.execute(SyncRequest::Updated(item_ids), true).await
    }

    /// Delete items and everything depending on them.
    #[instrument(skip(self, item_ids), fields(count = item_ids.len()))]
    pub async fn removed(&self, item_ids: Vec<String>) -> Result<BatchOutcome> {
        if item_ids.is_empty() {
            return Ok(BatchOutcome::Skipped);
        }
        self.execute(SyncRequest::Removed(item_ids), true).await
    }

    /// Apply user data changes reported for `user_id`. Changes for anyone
    /// other than the signed-in user are ignored.
    #[instrument(skip(self, changes), fields(count = changes.len()))]
    pub async fn userdata(
        &self,
        user_id: Option<&str>,
        changes: Vec<UserDataChange>,
    ) -> Result<BatchOutcome> {
        {
            let state = self.state.lock().await;
            if !state.started || state.user_id.as_deref() != user_id {
                debug!("Ignoring user data for another user or while stopped");
                return Ok(BatchOutcome::Skipped);
            }
        }
        if changes.is_empty() {
            return Ok(BatchOutcome::Skipped);
        }
        self.execute(SyncRequest::UserData(changes), true).await
    }

    /// Queue items for a deferred existence check instead of removing them.
    pub async fn delay_verify(&self, item_ids: Vec<String>) {
        if item_ids.is_empty() {
            return;
        }
        debug!(count = item_ids.len(), "Deferring existence check");
        self.state
            .lock()
            .await
            .verify
            .defer(item_ids, Instant::now());
    }

    /// Check every due deferred item against the server: items that still
    /// exist are refreshed, items that are gone are removed.
    pub async fn process_verify_queue(&self) -> Result<BatchOutcome> {
        let due = self.state.lock().await.verify.take_due(Instant::now());
        if due.is_empty() {
            return Ok(BatchOutcome::Skipped);
        }

        let result = self.execute(SyncRequest::Verify(due.clone()), true).await;
        if matches!(result, Err(_) | Ok(BatchOutcome::Skipped)) {
            debug!(count = due.len(), "Existence check did not run, deferring again");
            self.state.lock().await.verify.defer(due, Instant::now());
        }
        result
    }

    /// Run every batch queued after a lock timeout, once. Batches failing
    /// again are dropped, except existence checks which go back to the
    /// verify queue.
    pub async fn retry_pending(&self) -> usize {
        let pending: Vec<SyncRequest> = self.state.lock().await.pending.drain(..).collect();
        let count = pending.len();
        for request in pending {
            let library_id = request.library_id().to_string();
            let unverified = match &request {
                SyncRequest::Verify(ids) => Some(ids.clone()),
                _ => None,
            };
            if let Err(e) = self.execute(request, false).await {
                warn!(library_id = %library_id, error = %e, "Retried batch failed, dropping it");
                if let Some(ids) = unverified {
                    self.state.lock().await.verify.defer(ids, Instant::now());
                }
            }
        }
        count
    }

    /// Incremental pass over every selected library.
    #[instrument(skip(self))]
    pub async fn fast_sync(&self) -> Result<usize> {
        let libraries = self.selected_libraries().await;
        let mut synced = 0;
        for library_id in &libraries {
            match self.add_library(library_id, true).await {
                Ok(BatchOutcome::Committed { .. }) => synced += 1,
                Ok(_) => {}
                Err(e) => warn!(library_id = %library_id, error = %e, "Fast sync failed"),
            }
        }
        info!(synced, total = libraries.len(), "Fast sync finished");
        Ok(synced)
    }

    /// Re-run full syncs that were interrupted before their commit point.
    pub async fn resume_interrupted(&self) -> usize {
        let interrupted: Vec<(String, bool)> = {
            let state = self.state.lock().await;
            state
                .checkpoint
                .libraries
                .iter()
                .map(|id| (id.clone(), state.checkpoint.restore_point.contains_key(id)))
                .collect()
        };

        for (library_id, update) in &interrupted {
            info!(library_id = %library_id, "Resuming interrupted library sync");
            if let Err(e) = self.add_library(library_id, *update).await {
                warn!(library_id = %library_id, error = %e, "Resumed sync failed");
            }
        }
        interrupted.len()
    }

    /// Apply a selection change. Without explicit ids, sync, repair and
    /// remove act on every selected library.
    #[instrument(skip(self))]
    pub async fn select_libraries(
        &self,
        action: SelectionAction,
        library_ids: Vec<String>,
    ) -> Result<()> {
        let selected = self.selected_libraries().await;
        let targets: Vec<String> = if library_ids.is_empty() {
            if action == SelectionAction::Add {
                warn!("No libraries given to add");
                return Ok(());
            }
            selected.clone()
        } else if action == SelectionAction::Sync {
            library_ids
                .into_iter()
                .filter(|id| selected.contains(id))
                .collect()
        } else {
            library_ids
        };

        for library_id in &targets {
            match action {
                SelectionAction::Sync | SelectionAction::Add => {
                    self.add_library(library_id, false).await?;
                }
                SelectionAction::Remove => {
                    self.remove_library(library_id).await?;
                }
                SelectionAction::Repair => {
                    // The add must not overtake a removal waiting for its lock.
                    if self.remove_library(library_id).await? == BatchOutcome::Queued {
                        self.state
                            .lock()
                            .await
                            .pending
                            .push_back(SyncRequest::AddLibrary {
                                library_id: library_id.clone(),
                                update: false,
                            });
                    } else {
                        self.add_library(library_id, false).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-read the name and type of every selected library.
    pub async fn refresh_views(&self) -> Result<usize> {
        if !self.is_started().await {
            return Err(SyncError::NotStarted);
        }

        let mut views = Vec::new();
        for library_id in self.selected_libraries().await {
            let library = self.deps.server.get_library(&library_id).await?;
            views.push(LibraryView {
                library_id: library.id,
                name: library.name,
                media_type: library.media_type,
            });
        }
        if views.is_empty() {
            return Ok(0);
        }

        let count = views.len();
        self.write_catalog(move |session| {
            Box::pin(async move {
                let mut catalog = session.catalog()?;
                for view in &views {
                    catalog.upsert_view(view).await?;
                }
                Ok(())
            })
        })
        .await?;
        debug!(count, "Library views refreshed");
        Ok(count)
    }

    /// Ask the server to refresh an item's metadata.
    pub async fn refresh_item(&self, item_id: &str) -> Result<()> {
        self.deps.server.refresh_item(item_id).await?;
        Ok(())
    }

    /// Delete an item on the server, then locally.
    pub async fn delete_item(&self, item_id: &str) -> Result<BatchOutcome> {
        self.deps.server.delete_item(item_id).await?;
        self.removed(vec![item_id.to_string()]).await
    }

    async fn execute(&self, request: SyncRequest, allow_queue: bool) -> Result<BatchOutcome> {
        if !self.is_started().await {
            return Err(SyncError::NotStarted);
        }
        if self.stopping() {
            debug!(library_id = %request.library_id(), "Stopping, not starting a new batch");
            return Ok(BatchOutcome::Skipped);
        }

        let _batch = BatchGuard::enter(self);
        let result = match &request {
            SyncRequest::AddLibrary { library_id, update } => {
                self.sync_library(library_id, *update).await
            }
            SyncRequest::RemoveLibrary(library_id) => self.drop_library(library_id).await,
            SyncRequest::Updated(ids) => self.apply_updates(ids.clone()).await,
            SyncRequest::Removed(ids) => self.apply_removals(ids.clone()).await,
            SyncRequest::UserData(changes) => self.apply_user_data(changes.clone()).await,
            SyncRequest::Verify(ids) => self.apply_verification(ids.clone()).await,
        };

        let library_id = request.library_id().to_string();
        match result {
            Err(e) if e.is_lock_timeout() && allow_queue => {
                warn!(library_id = %library_id, error = %e, "Lock busy, queued for retry");
                self.emit(LibraryEvent::BatchFailed {
                    library_id,
                    message: e.to_string(),
                    queued_for_retry: true,
                });
                self.state.lock().await.pending.push_back(request);
                Ok(BatchOutcome::Queued)
            }
            Err(e) => {
                match &e {
                    SyncError::Stopped { .. } => info!(library_id = %library_id, "{}", e),
                    _ => error!(library_id = %library_id, error = %e, "Sync batch failed"),
                }
                self.emit(LibraryEvent::BatchFailed {
                    library_id,
                    message: e.to_string(),
                    queued_for_retry: false,
                });
                Err(e)
            }
            ok => ok,
        }
    }

    fn stopping(&self) -> bool {
        self.should_stop.is_set() || self.abort.is_cancelled()
    }

    fn lock(&self, resource: impl Into<String>) -> ProcessLock {
        ProcessLock::new(self.deps.flags.clone(), resource)
            .with_config(self.config.lock)
            .with_abort(self.abort.clone())
    }

    /// Run `work` in a committing catalog session under the catalog lock.
    async fn write_catalog<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T>>,
    {
        let mut lock = self.lock(CATALOG);
        lock.run_locked(
            self.config.catalog_lock_wait,
            self.deps.store.with_session(CATALOG, SessionMode::Commit, work),
        )
        .await
    }

    async fn update_checkpoint<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut SyncCheckpoint),
    {
        let mut state = self.state.lock().await;
        let mut checkpoint = state.checkpoint.clone();
        change(&mut checkpoint);
        let now = self.deps.clock.now();
        self.checkpoint_file.save(&mut checkpoint, now).await?;
        state.checkpoint = checkpoint;
        Ok(())
    }

    /// Run `work` holding `sync.<library id>` for every library it touches.
    /// Locks are taken in id order.
    async fn with_library_locks<T, Fut>(
        &self,
        library_ids: BTreeSet<String>,
        work: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut held = Vec::with_capacity(library_ids.len());
        let mut acquired: Result<()> = Ok(());
        for library_id in &library_ids {
            let mut lock = self.lock(format!("sync.{}", library_id));
            match lock.acquire(true, Some(self.config.catalog_lock_wait)).await {
                Ok(true) => held.push(lock),
                Ok(false) => {
                    acquired = Err(StoreError::LockTimeout {
                        resource: lock.resource().to_string(),
                    }
                    .into());
                    break;
                }
                Err(e) => {
                    acquired = Err(e.into());
                    break;
                }
            }
        }

        let result = match acquired {
            Ok(()) => work.await,
            Err(e) => Err(e),
        };
        for mut lock in held {
            if let Err(e) = lock.release().await {
                warn!(resource = %lock.resource(), error = %e, "Failed to release library lock");
            }
        }
        result
    }

    /// Libraries the catalog files these items under.
    async fn libraries_of(&self, item_ids: &[String]) -> Result<BTreeSet<String>> {
        if item_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let item_ids = item_ids.to_vec();
        self.deps
            .store
            .with_session::<_, SyncError, _>(CATALOG, SessionMode::ReadOnly, move |session| {
                Box::pin(async move {
                    let mut catalog = session.catalog()?;
                    let mut libraries = BTreeSet::new();
                    for id in &item_ids {
                        if let Some(item) = catalog.get_item(id).await? {
                            libraries.insert(item.library_id);
                        }
                    }
                    Ok(libraries)
                })
            })
            .await
    }

    /// Holds `sync.<library id>` for the whole batch; releasing it after the
    /// RestorePoint save makes that save the commit point.
    async fn sync_library(&self, library_id: &str, update: bool) -> Result<BatchOutcome> {
        let mut library_lock = self.lock(format!("sync.{}", library_id));
        if !library_lock
            .acquire(true, Some(self.config.catalog_lock_wait))
            .await?
        {
            return Err(StoreError::LockTimeout {
                resource: library_lock.resource().to_string(),
            }
            .into());
        }

        let result = self.sync_library_locked(library_id, update).await;
        if let Err(e) = library_lock.release().await {
            warn!(library_id = %library_id, error = %e, "Failed to release library lock");
        }
        result
    }

    async fn sync_library_locked(&self, library_id: &str, update: bool) -> Result<BatchOutcome> {
        self.emit(LibraryEvent::BatchStarted {
            library_id: library_id.to_string(),
            incremental: update,
        });

        let library = self.deps.server.get_library(library_id).await?;
        let since = if update {
            self.restore_point(library_id).await
        } else {
            None
        };

        self.update_checkpoint(|checkpoint| {
            checkpoint.select(library_id);
            checkpoint.mark_pending(library_id);
        })
        .await?;

        let view = LibraryView {
            library_id: library.id,
            name: library.name,
            media_type: library.media_type,
        };
        self.write_catalog(move |session| {
            Box::pin(async move {
                session.catalog()?.upsert_view(&view).await?;
                Ok(())
            })
        })
        .await?;

        let page_size = self.config.page_size.max(1);
        let mut start = 0usize;
        let mut upserted = 0u64;
        let mut cursor = None;

        loop {
            if self.stopping() {
                return Err(SyncError::Stopped {
                    library_id: library_id.to_string(),
                });
            }

            let page = self
                .deps
                .server
                .list_library_items(library_id, since.as_deref(), start, page_size)
                .await?;
            let count = page.items.len();
            let items: Vec<CatalogItem> = page.items.iter().map(CatalogItem::from_remote).collect();

            self.write_catalog(move |session| {
                Box::pin(async move {
                    let mut catalog = session.catalog()?;
                    for item in &items {
                        catalog.upsert_item(item).await?;
                    }
                    Ok(())
                })
            })
            .await?;

            debug!(library_id = %library_id, start, count, total = page.total, "Page committed");
            upserted += count as u64;
            start += count;
            cursor = Some(page.cursor);

            if count < page_size || start >= page.total {
                break;
            }
        }

        let cursor = cursor
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.deps.clock.now().format(DATE_FORMAT).to_string());
        self.update_checkpoint(|checkpoint| checkpoint.complete(library_id, cursor.clone()))
            .await?;

        info!(library_id = %library_id, upserted, restore_point = %cursor, "Library synced");
        self.emit(LibraryEvent::BatchCommitted {
            library_id: library_id.to_string(),
            items_upserted: upserted,
            items_removed: 0,
            restore_point: Some(cursor),
        });
        Ok(BatchOutcome::Committed {
            upserted,
            removed: 0,
        })
    }

    async fn drop_library(&self, library_id: &str) -> Result<BatchOutcome> {
        let mut library_lock = self.lock(format!("sync.{}", library_id));
        let owned_id = library_id.to_string();
        let removed = library_lock
            .run_locked(
                self.config.catalog_lock_wait,
                self.write_catalog(move |session| {
                    Box::pin(async move {
                        let mut catalog = session.catalog()?;
                        let removed = catalog.delete_library_items(&owned_id).await?;
                        catalog.remove_view(&owned_id).await?;
                        Ok(removed)
                    })
                }),
            )
            .await?;

        self.update_checkpoint(|checkpoint| checkpoint.forget(library_id))
            .await?;

        info!(library_id = %library_id, removed, "Library removed");
        self.emit(LibraryEvent::LibraryRemoved {
            library_id: library_id.to_string(),
        });
        Ok(BatchOutcome::Committed {
            upserted: 0,
            removed,
        })
    }

    async fn apply_updates(&self, item_ids: Vec<String>) -> Result<BatchOutcome> {
        let remote = self.deps.server.get_items(&item_ids).await?;
        let items: Vec<CatalogItem> = {
            let state = self.state.lock().await;
            remote
                .iter()
                .filter(|item| state.checkpoint.is_selected(&item.library_id))
                .map(CatalogItem::from_remote)
                .collect()
        };
        if items.is_empty() {
            debug!("No updated items belong to selected libraries");
            return Ok(BatchOutcome::Skipped);
        }

        let per_library = count_by_library(&items);
        let libraries = per_library.keys().cloned().collect();
        let upserted = items.len() as u64;
        self.with_library_locks(
            libraries,
            self.write_catalog(move |session| {
                Box::pin(async move {
                    let mut catalog = session.catalog()?;
                    for item in &items {
                        catalog.upsert_item(item).await?;
                    }
                    Ok(())
                })
            }),
        )
        .await?;

        for (library_id, count) in per_library {
            self.emit(LibraryEvent::BatchCommitted {
                library_id,
                items_upserted: count,
                items_removed: 0,
                restore_point: None,
            });
        }
        Ok(BatchOutcome::Committed {
            upserted,
            removed: 0,
        })
    }

    async fn apply_removals(&self, item_ids: Vec<String>) -> Result<BatchOutcome> {
        let libraries = self.libraries_of(&item_ids).await?;
        let removed = self
            .with_library_locks(
                libraries,
                self.write_catalog(move |session| {
                    Box::pin(remove_with_dependents(session, item_ids))
                }),
            )
            .await?;

        let count = removed.len() as u64;
        for (library_id, items_removed) in count_by_library(&removed) {
            self.emit(LibraryEvent::BatchCommitted {
                library_id,
                items_upserted: 0,
                items_removed,
                restore_point: None,
            });
        }
        Ok(BatchOutcome::Committed {
            upserted: 0,
            removed: count,
        })
    }

    async fn apply_user_data(&self, changes: Vec<UserDataChange>) -> Result<BatchOutcome> {
        let updated = self
            .write_catalog(move |session| {
                Box::pin(async move {
                    let mut catalog = session.catalog()?;
                    let mut updated = 0u64;
                    for change in &changes {
                        let data = Value::Object(change.data.clone()).to_string();
                        if catalog.set_user_data(&change.item_id, &data).await? {
                            updated += 1;
                        }
                    }
                    Ok(updated)
                })
            })
            .await?;

        if updated > 0 {
            self.emit(LibraryEvent::BatchCommitted {
                library_id: ALL_LIBRARIES.to_string(),
                items_upserted: updated,
                items_removed: 0,
                restore_point: None,
            });
        }
        Ok(BatchOutcome::Committed {
            upserted: updated,
            removed: 0,
        })
    }

    async fn apply_verification(&self, item_ids: Vec<String>) -> Result<BatchOutcome> {
        let remote = self.deps.server.get_items(&item_ids).await?;
        let existing: HashSet<&str> = remote.iter().map(|item| item.id.as_str()).collect();
        let missing: Vec<String> = item_ids
            .iter()
            .filter(|id| !existing.contains(id.as_str()))
            .cloned()
            .collect();
        let present: Vec<CatalogItem> = {
            let state = self.state.lock().await;
            remote
                .iter()
                .filter(|item| state.checkpoint.is_selected(&item.library_id))
                .map(CatalogItem::from_remote)
                .collect()
        };

        debug!(present = present.len(), missing = missing.len(), "Verifying deferred items");
        let mut libraries = self.libraries_of(&missing).await?;
        libraries.extend(present.iter().map(|item| item.library_id.clone()));
        let (upserted, removed) = self
            .with_library_locks(
                libraries,
                self.write_catalog(move |session| {
                    Box::pin(async move {
                        {
                            let mut catalog = session.catalog()?;
                            for item in &present {
                                catalog.upsert_item(item).await?;
                            }
                        }
                        let removed = remove_with_dependents(session, missing).await?;
                        Ok((present.len() as u64, removed.len() as u64))
                    })
                }),
            )
            .await?;

        Ok(BatchOutcome::Committed { upserted, removed })
    }

    fn emit(&self, event: LibraryEvent) {
        let _ = self.deps.events.emit(CoreEvent::Library(event));
    }
}

/// Delete items and, transitively, the items parented to them. Artwork rows
/// cascade in the store.
async fn remove_with_dependents(
    session: &mut Session,
    item_ids: Vec<String>,
) -> Result<Vec<CatalogItem>> {
    let mut catalog = session.catalog()?;
    let mut removed = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = item_ids;

    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        for child in catalog.children_of(&id).await? {
            stack.push(child.remote_id);
        }
        if let Some(item) = catalog.delete_item(&id).await? {
            removed.push(item);
        }
    }
    Ok(removed)
}

fn count_by_library(items: &[CatalogItem]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(item.library_id.clone()).or_insert(0) += 1;
    }
    counts
}
