//! Library sync against a real catalog file and a scripted media server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_desktop::InMemoryFlagStore;
use bridge_traits::{
    BridgeError, Clock, DeviceInfo, ItemPage, MediaServer, RemoteItem, RemoteLibrary,
    SharedFlagStore,
};
use chrono::{DateTime, TimeZone, Utc};
use core_library::{
    initialize_catalog, CatalogItem, DataStore, LibraryView, LockConfig, ProcessLock, SessionMode,
    StoreLocator, CATALOG,
};
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent};
use core_runtime::Flag;
use core_sync::{
    BatchOutcome, CheckpointFile, SelectionAction, SyncConfig, SyncDeps, SyncError,
    SyncOrchestrator, UserDataChange,
};
use mockall::mock;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

mock! {
    pub WallClock {}
    impl Clock for WallClock {
        fn now(&self) -> DateTime<Utc>;
    }
}

fn item(id: &str, library_id: &str, parent_id: Option<&str>) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        library_id: library_id.to_string(),
        item_type: if parent_id.is_some() { "Episode" } else { "Movie" }.to_string(),
        media_type: "Video".to_string(),
        parent_id: parent_id.map(str::to_string),
        checksum: Some(format!("etag-{}", id)),
    }
}

/// Scripted server: libraries as plain item lists, paged by position.
#[derive(Default)]
struct FakeServer {
    libraries: Mutex<HashMap<String, Vec<RemoteItem>>>,
    fail_at_start: Mutex<Option<usize>>,
    names: Mutex<HashMap<String, String>>,
    refreshed: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    fail_lookups: Mutex<bool>,
    /// Replaced by a directory on the next listing, so saving it fails.
    checkpoint_trap: Mutex<Option<PathBuf>>,
}

impl FakeServer {
    fn with_library(self, library_id: &str, ids: &[&str]) -> Self {
        let items = ids.iter().map(|id| item(id, library_id, None)).collect();
        self.libraries
            .lock()
            .unwrap()
            .insert(library_id.to_string(), items);
        self
    }

    fn push(&self, item: RemoteItem) {
        let mut libraries = self.libraries.lock().unwrap();
        let items = libraries.entry(item.library_id.clone()).or_default();
        items.retain(|existing| existing.id != item.id);
        items.push(item);
    }

    fn drop_item(&self, item_id: &str) {
        for items in self.libraries.lock().unwrap().values_mut() {
            items.retain(|item| item.id != item_id);
        }
    }

    fn fail_listing_at(&self, start: Option<usize>) {
        *self.fail_at_start.lock().unwrap() = start;
    }

    fn fail_lookups(&self, fail: bool) {
        *self.fail_lookups.lock().unwrap() = fail;
    }

    fn break_checkpoint_on_listing(&self, path: PathBuf) {
        *self.checkpoint_trap.lock().unwrap() = Some(path);
    }
}

#[async_trait]
impl MediaServer for FakeServer {
    async fn get_device(&self, device_id: &str) -> bridge_traits::Result<DeviceInfo> {
        Ok(DeviceInfo {
            id: device_id.to_string(),
            name: "test".to_string(),
            user_id: None,
            supports_remote_control: false,
        })
    }

    async fn refresh_item(&self, item_id: &str) -> bridge_traits::Result<()> {
        self.refreshed.lock().unwrap().push(item_id.to_string());
        Ok(())
    }

    async fn delete_item(&self, item_id: &str) -> bridge_traits::Result<()> {
        self.deleted.lock().unwrap().push(item_id.to_string());
        self.drop_item(item_id);
        Ok(())
    }

    async fn get_library(&self, library_id: &str) -> bridge_traits::Result<RemoteLibrary> {
        let name = self
            .names
            .lock()
            .unwrap()
            .get(library_id)
            .cloned()
            .unwrap_or_else(|| format!("Library {}", library_id));
        Ok(RemoteLibrary {
            id: library_id.to_string(),
            name,
            media_type: "movies".to_string(),
        })
    }

    async fn get_items(&self, item_ids: &[String]) -> bridge_traits::Result<Vec<RemoteItem>> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(BridgeError::OperationFailed("server busy".to_string()));
        }
        let libraries = self.libraries.lock().unwrap();
        Ok(libraries
            .values()
            .flatten()
            .filter(|item| item_ids.contains(&item.id))
            .cloned()
            .collect())
    }

    async fn list_library_items(
        &self,
        library_id: &str,
        _since: Option<&str>,
        start: usize,
        limit: usize,
    ) -> bridge_traits::Result<ItemPage> {
        if *self.fail_at_start.lock().unwrap() == Some(start) {
            return Err(BridgeError::OperationFailed("connection reset".to_string()));
        }
        if let Some(path) = self.checkpoint_trap.lock().unwrap().take() {
            std::fs::remove_file(&path).unwrap();
            std::fs::create_dir(&path).unwrap();
        }
        let libraries = self.libraries.lock().unwrap();
        let all = libraries.get(library_id).cloned().unwrap_or_default();
        let items = all.iter().skip(start).take(limit).cloned().collect();
        Ok(ItemPage {
            items,
            total: all.len(),
            cursor: format!("cursor-{}", all.len()),
        })
    }
}

struct Fixture {
    _dir: TempDir,
    server: Arc<FakeServer>,
    flags: Arc<dyn SharedFlagStore>,
    store: DataStore,
    events: EventBus,
    stop: Flag,
    checkpoint: CheckpointFile,
    orchestrator: SyncOrchestrator,
}

fn test_config() -> SyncConfig {
    SyncConfig {
        page_size: 2,
        catalog_lock_wait: Duration::from_millis(200),
        verify_delay: Duration::ZERO,
        lock: LockConfig::default(),
    }
}

async fn fixture(server: FakeServer) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.db");
    initialize_catalog(&catalog_path).await.unwrap();

    let mut clock = MockWallClock::new();
    clock
        .expect_now()
        .returning(|| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

    let server = Arc::new(server);
    let flags: Arc<dyn SharedFlagStore> = Arc::new(InMemoryFlagStore::new());
    let store = DataStore::new(Arc::new(StoreLocator::for_host(&catalog_path, None, None)));
    let events = EventBus::default();
    let stop = Flag::new();
    let checkpoint = CheckpointFile::new(dir.path().join("sync.json"));

    let orchestrator = SyncOrchestrator::new(
        SyncDeps {
            store: store.clone(),
            flags: flags.clone(),
            server: server.clone(),
            events: events.clone(),
            clock: Arc::new(clock),
        },
        CheckpointFile::new(checkpoint.path().to_path_buf()),
        test_config(),
        stop.reader(),
        CancellationToken::new(),
    );
    orchestrator.start("user-1").await;

    Fixture {
        _dir: dir,
        server,
        flags,
        store,
        events,
        stop,
        checkpoint,
        orchestrator,
    }
}

impl Fixture {
    async fn items(&self, library_id: &str) -> Vec<CatalogItem> {
        let library_id = library_id.to_string();
        self.store
            .with_session(CATALOG, SessionMode::ReadOnly, move |session| {
                Box::pin(async move { session.catalog()?.items_in_library(&library_id).await })
            })
            .await
            .unwrap()
    }

    async fn item_ids(&self, library_id: &str) -> Vec<String> {
        self.items(library_id)
            .await
            .into_iter()
            .map(|item| item.remote_id)
            .collect()
    }

    async fn views(&self) -> Vec<LibraryView> {
        self.store
            .with_session(CATALOG, SessionMode::ReadOnly, |session| {
                Box::pin(async move { session.catalog()?.list_views().await })
            })
            .await
            .unwrap()
    }

    async fn get(&self, remote_id: &str) -> Option<CatalogItem> {
        let remote_id = remote_id.to_string();
        self.store
            .with_session(CATALOG, SessionMode::ReadOnly, move |session| {
                Box::pin(async move { session.catalog()?.get_item(&remote_id).await })
            })
            .await
            .unwrap()
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint.path().to_path_buf()
    }
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn test_full_sync_pages_through_library_and_commits_restore_point() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b", "c", "d", "e"])).await;
    let mut events = fx.events.subscribe();

    let outcome = fx.orchestrator.add_library("movies", false).await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome::Committed {
            upserted: 5,
            removed: 0
        }
    );
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b", "c", "d", "e"]));
    assert_eq!(fx.views().await.len(), 1);

    let saved = fx.checkpoint.load().await;
    assert_eq!(saved.whitelist, ids(&["movies"]));
    assert!(saved.libraries.is_empty());
    assert_eq!(
        saved.restore_point.get("movies").map(String::as_str),
        Some("cursor-5")
    );
    assert_eq!(saved.date.as_deref(), Some("2024-05-01T12:00:00Z"));

    match events.recv().await.unwrap() {
        CoreEvent::Library(LibraryEvent::BatchStarted {
            library_id,
            incremental,
        }) => {
            assert_eq!(library_id, "movies");
            assert!(!incremental);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match events.recv().await.unwrap() {
        CoreEvent::Library(LibraryEvent::BatchCommitted {
            items_upserted,
            restore_point,
            ..
        }) => {
            assert_eq!(items_upserted, 5);
            assert_eq!(restore_point.as_deref(), Some("cursor-5"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_interrupted_sync_keeps_restore_point_and_rerun_converges() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b", "c", "d", "e"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    let committed = fx.checkpoint.load().await.restore_point;

    fx.server.push(item("f", "movies", None));
    fx.server.fail_listing_at(Some(2));

    let err = fx.orchestrator.add_library("movies", true).await.unwrap_err();
    assert!(matches!(err, SyncError::Server(_)));

    let after_crash = fx.checkpoint.load().await;
    assert_eq!(after_crash.restore_point, committed);
    assert_eq!(after_crash.libraries, ids(&["movies"]));

    fx.server.fail_listing_at(None);
    assert_eq!(fx.orchestrator.resume_interrupted().await, 1);

    let reference =
        fixture(FakeServer::default().with_library("movies", &["a", "b", "c", "d", "e", "f"]))
            .await;
    reference.orchestrator.add_library("movies", false).await.unwrap();

    assert_eq!(fx.items("movies").await, reference.items("movies").await);
    let resumed = fx.checkpoint.load().await;
    assert!(resumed.libraries.is_empty());
    assert_eq!(
        resumed.restore_point,
        reference.checkpoint.load().await.restore_point
    );
}

#[tokio::test]
async fn test_repair_matches_remove_then_add() {
    let repaired = fixture(FakeServer::default().with_library("movies", &["a", "b", "c"])).await;
    let rebuilt = fixture(FakeServer::default().with_library("movies", &["a", "b", "c"])).await;

    for fx in [&repaired, &rebuilt] {
        fx.orchestrator.add_library("movies", false).await.unwrap();
        fx.server.drop_item("b");
        fx.server.push(item("d", "movies", None));
    }

    repaired
        .orchestrator
        .select_libraries(SelectionAction::Repair, ids(&["movies"]))
        .await
        .unwrap();
    rebuilt.orchestrator.remove_library("movies").await.unwrap();
    rebuilt.orchestrator.add_library("movies", false).await.unwrap();

    assert_eq!(repaired.items("movies").await, rebuilt.items("movies").await);
    assert_eq!(repaired.item_ids("movies").await, ids(&["a", "c", "d"]));
    assert_eq!(repaired.views().await, rebuilt.views().await);

    let left = repaired.checkpoint.load().await;
    let right = rebuilt.checkpoint.load().await;
    assert_eq!(left.whitelist, right.whitelist);
    assert_eq!(left.restore_point, right.restore_point);
}

#[tokio::test]
async fn test_repair_keeps_order_when_removal_is_queued() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();

    let mut other_instance = ProcessLock::new(fx.flags.clone(), CATALOG);
    assert!(other_instance.acquire(false, None).await.unwrap());
    let released = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        other_instance.release().await.unwrap();
    });

    fx.orchestrator
        .select_libraries(SelectionAction::Repair, ids(&["movies"]))
        .await
        .unwrap();
    assert_eq!(fx.orchestrator.pending_retries().await, 2);
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b"]));

    released.await.unwrap();
    assert_eq!(fx.orchestrator.retry_pending().await, 2);

    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b"]));
    assert_eq!(fx.orchestrator.selected_libraries().await, ids(&["movies"]));
    assert_eq!(fx.views().await.len(), 1);
}

#[tokio::test]
async fn test_failed_checkpoint_save_keeps_restore_point() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b", "c"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    fx.server.push(item("d", "movies", None));
    fx.server.break_checkpoint_on_listing(fx.checkpoint_path());

    let err = fx.orchestrator.add_library("movies", true).await.unwrap_err();

    assert!(matches!(err, SyncError::Checkpoint(_)));
    assert_eq!(
        fx.orchestrator.restore_point("movies").await.as_deref(),
        Some("cursor-3")
    );
}

#[tokio::test]
async fn test_incremental_batches_wait_for_the_library_lock() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();

    let mut full_sync = ProcessLock::new(fx.flags.clone(), "sync.movies");
    assert!(full_sync.acquire(false, None).await.unwrap());

    let mut changed = item("a", "movies", None);
    changed.checksum = Some("etag-a-2".to_string());
    fx.server.push(changed);

    assert_eq!(
        fx.orchestrator.updated(ids(&["a"])).await.unwrap(),
        BatchOutcome::Queued
    );
    assert_eq!(
        fx.orchestrator.removed(ids(&["b"])).await.unwrap(),
        BatchOutcome::Queued
    );
    assert_eq!(fx.get("a").await.unwrap().checksum.as_deref(), Some("etag-a"));
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b"]));

    full_sync.release().await.unwrap();
    assert_eq!(fx.orchestrator.retry_pending().await, 2);

    assert_eq!(
        fx.get("a").await.unwrap().checksum.as_deref(),
        Some("etag-a-2")
    );
    assert_eq!(fx.item_ids("movies").await, ids(&["a"]));
}

#[tokio::test]
async fn test_failed_existence_check_stays_queued() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    fx.orchestrator.delay_verify(ids(&["a"])).await;
    fx.server.fail_lookups(true);

    let err = fx.orchestrator.process_verify_queue().await.unwrap_err();

    assert!(matches!(err, SyncError::Server(_)));
    assert_eq!(fx.orchestrator.verify_backlog().await, 1);

    fx.server.fail_lookups(false);
    fx.server.drop_item("a");
    assert_eq!(
        fx.orchestrator.process_verify_queue().await.unwrap(),
        BatchOutcome::Committed {
            upserted: 0,
            removed: 1
        }
    );
    assert_eq!(fx.item_ids("movies").await, ids(&["b"]));
    assert_eq!(fx.orchestrator.verify_backlog().await, 0);
}

#[tokio::test]
async fn test_library_changed_upserts_removes_and_defers() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "c", "d"])).await;
    fx.server.push(item("c-1", "movies", Some("c")));
    fx.orchestrator.add_library("movies", false).await.unwrap();

    fx.store
        .with_session(CATALOG, SessionMode::Commit, |session| {
            Box::pin(async move {
                session
                    .catalog()?
                    .upsert_artwork("c-1", "Primary", "http://art/c-1")
                    .await
            })
        })
        .await
        .unwrap();

    let mut changed = item("a", "movies", None);
    changed.checksum = Some("etag-a-2".to_string());
    fx.server.push(changed);
    fx.server.push(item("b", "movies", None));

    let updated = fx.orchestrator.updated(ids(&["a", "b"])).await.unwrap();
    let removed = fx.orchestrator.removed(ids(&["c"])).await.unwrap();
    fx.orchestrator.delay_verify(ids(&["d"])).await;

    assert_eq!(
        updated,
        BatchOutcome::Committed {
            upserted: 2,
            removed: 0
        }
    );
    assert_eq!(
        removed,
        BatchOutcome::Committed {
            upserted: 0,
            removed: 2
        }
    );
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b", "d"]));
    assert_eq!(
        fx.get("a").await.unwrap().checksum.as_deref(),
        Some("etag-a-2")
    );
    assert_eq!(fx.orchestrator.verify_backlog().await, 1);

    fx.server.drop_item("d");
    let verified = fx.orchestrator.process_verify_queue().await.unwrap();
    assert_eq!(
        verified,
        BatchOutcome::Committed {
            upserted: 0,
            removed: 1
        }
    );
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b"]));
    assert_eq!(fx.orchestrator.verify_backlog().await, 0);
}

#[tokio::test]
async fn test_updates_outside_the_selection_are_ignored() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    fx.server.push(item("s-1", "shows", None));

    let outcome = fx.orchestrator.updated(ids(&["s-1"])).await.unwrap();

    assert_eq!(outcome, BatchOutcome::Skipped);
    assert!(fx.get("s-1").await.is_none());
}

#[tokio::test]
async fn test_verified_items_that_still_exist_are_kept() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();

    fx.orchestrator.delay_verify(ids(&["a"])).await;
    let outcome = fx.orchestrator.process_verify_queue().await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome::Committed {
            upserted: 1,
            removed: 0
        }
    );
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b"]));
    assert_eq!(
        fx.orchestrator.process_verify_queue().await.unwrap(),
        BatchOutcome::Skipped
    );
}

#[tokio::test]
async fn test_lock_timeout_is_queued_and_retried_once() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b", "c"])).await;
    let mut other_instance = ProcessLock::new(fx.flags.clone(), CATALOG);
    assert!(other_instance.acquire(false, None).await.unwrap());

    let outcome = fx.orchestrator.add_library("movies", false).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Queued);
    assert_eq!(fx.orchestrator.pending_retries().await, 1);
    assert!(fx.item_ids("movies").await.is_empty());

    other_instance.release().await.unwrap();
    assert_eq!(fx.orchestrator.retry_pending().await, 1);

    assert_eq!(fx.orchestrator.pending_retries().await, 0);
    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b", "c"]));
    assert!(fx.checkpoint.load().await.libraries.is_empty());
}

#[tokio::test]
async fn test_retry_pass_drops_batches_that_time_out_again() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    let mut other_instance = ProcessLock::new(fx.flags.clone(), CATALOG);
    assert!(other_instance.acquire(false, None).await.unwrap());

    assert_eq!(
        fx.orchestrator.updated(ids(&["a"])).await.unwrap(),
        BatchOutcome::Skipped
    );
    assert_eq!(
        fx.orchestrator.removed(ids(&["a"])).await.unwrap(),
        BatchOutcome::Queued
    );
    assert_eq!(fx.orchestrator.retry_pending().await, 1);
    assert_eq!(fx.orchestrator.pending_retries().await, 0);
    other_instance.release().await.unwrap();
}

#[tokio::test]
async fn test_user_data_is_applied_only_for_the_signed_in_user() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    let changes: Vec<UserDataChange> =
        serde_json::from_str(r#"[{"ItemId":"a","Played":true}]"#).unwrap();

    let ignored = fx
        .orchestrator
        .userdata(Some("someone-else"), changes.clone())
        .await
        .unwrap();
    assert_eq!(ignored, BatchOutcome::Skipped);
    assert!(fx.get("a").await.unwrap().user_data.is_none());

    fx.orchestrator
        .userdata(Some("user-1"), changes)
        .await
        .unwrap();
    assert_eq!(
        fx.get("a").await.unwrap().user_data.as_deref(),
        Some(r#"{"Played":true}"#)
    );
}

#[tokio::test]
async fn test_stop_request_prevents_new_batches() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    fx.stop.set();

    let outcome = fx.orchestrator.add_library("movies", false).await.unwrap();

    assert_eq!(outcome, BatchOutcome::Skipped);
    assert!(!fx.checkpoint_path().exists());
    assert!(fx.orchestrator.drain(Duration::from_millis(10)).await);
}

#[tokio::test]
async fn test_stopped_orchestrator_rejects_work() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    fx.orchestrator.stop().await;

    let err = fx.orchestrator.add_library("movies", false).await.unwrap_err();

    assert!(matches!(err, SyncError::NotStarted));
    assert!(fx.orchestrator.user_id().await.is_none());
}

#[tokio::test]
async fn test_selection_without_ids_applies_to_every_selected_library() {
    let fx = fixture(
        FakeServer::default()
            .with_library("movies", &["a"])
            .with_library("shows", &["s"]),
    )
    .await;
    fx.orchestrator
        .select_libraries(SelectionAction::Add, ids(&["movies", "shows"]))
        .await
        .unwrap();
    assert_eq!(
        fx.orchestrator.selected_libraries().await,
        ids(&["movies", "shows"])
    );

    fx.orchestrator
        .select_libraries(SelectionAction::Add, Vec::new())
        .await
        .unwrap();
    fx.orchestrator
        .select_libraries(SelectionAction::Remove, Vec::new())
        .await
        .unwrap();

    assert!(fx.orchestrator.selected_libraries().await.is_empty());
    assert!(fx.views().await.is_empty());
    assert!(fx.item_ids("movies").await.is_empty());
}

#[tokio::test]
async fn test_fast_sync_runs_incremental_pass_for_selected_libraries() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    fx.server.push(item("b", "movies", None));
    let mut events = fx.events.subscribe();

    assert_eq!(fx.orchestrator.fast_sync().await.unwrap(), 1);

    assert_eq!(fx.item_ids("movies").await, ids(&["a", "b"]));
    match events.recv().await.unwrap() {
        CoreEvent::Library(LibraryEvent::BatchStarted { incremental, .. }) => assert!(incremental),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_item_removes_remotely_then_locally() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a", "b"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();

    fx.orchestrator.refresh_item("b").await.unwrap();
    fx.orchestrator.delete_item("a").await.unwrap();

    assert_eq!(*fx.server.refreshed.lock().unwrap(), ids(&["b"]));
    assert_eq!(*fx.server.deleted.lock().unwrap(), ids(&["a"]));
    assert_eq!(fx.item_ids("movies").await, ids(&["b"]));
}

#[tokio::test]
async fn test_refresh_views_picks_up_renamed_libraries() {
    let fx = fixture(FakeServer::default().with_library("movies", &["a"])).await;
    fx.orchestrator.add_library("movies", false).await.unwrap();
    fx.server
        .names
        .lock()
        .unwrap()
        .insert("movies".to_string(), "Films".to_string());

    assert_eq!(fx.orchestrator.refresh_views().await.unwrap(), 1);

    let views = fx.views().await;
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].name, "Films");
}
