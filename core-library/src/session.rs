//! # Scoped Store Sessions
//!
//! A [`Session`] is one connection plus one open transaction against a single
//! logical store. It is closed exactly once:
//!
//! - [`SessionMode::Commit`] sessions that succeeded and changed at least one
//!   row commit.
//! - Everything else rolls back, including a session dropped without being
//!   closed.
//!
//! [`DataStore::with_session`] wraps the open/close pairing so callers cannot
//! miss an exit path.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::{debug, instrument, warn};

use crate::catalog::CatalogStore;
use crate::error::{Result, StoreError};
use crate::locator::StoreLocator;

/// Default bound on opening a store.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Commit on successful close if anything changed.
    Commit,
    /// Always roll back.
    ReadOnly,
}

/// Entry point for opening sessions against located stores.
#[derive(Clone)]
pub struct DataStore {
    locator: Arc<StoreLocator>,
    open_timeout: Duration,
}

impl DataStore {
    pub fn new(locator: Arc<StoreLocator>) -> Self {
        Self {
            locator,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn locator(&self) -> &Arc<StoreLocator> {
        &self.locator
    }

    /// Open a session on `resource`.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreUnavailable`] when the store cannot be located, does
    /// not exist, cannot be opened within the open timeout, or lacks the
    /// tables its descriptor requires.
    #[instrument(skip(self), fields(resource = %resource))]
    pub async fn open(&self, resource: &str, mode: SessionMode) -> Result<Session> {
        let path = self.locator.resolve(resource).await?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::unavailable(resource, e.to_string()))?;
        if !exists {
            return Err(StoreError::unavailable(
                resource,
                format!("{} does not exist", path.display()),
            ));
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(self.open_timeout)
            .create_if_missing(false);

        let connect = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.open_timeout)
            .connect_with(options);

        let pool = match tokio::time::timeout(self.open_timeout, connect).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => return Err(StoreError::unavailable(resource, e.to_string())),
            Err(_) => {
                return Err(StoreError::unavailable(
                    resource,
                    format!("not opened within {:?}", self.open_timeout),
                ))
            }
        };

        if let Err(e) = self.validate(resource, &pool).await {
            pool.close().await;
            return Err(e);
        }

        let tx = pool.begin().await?;
        debug!(?mode, "Session opened");

        Ok(Session {
            resource: resource.to_string(),
            mode,
            pool,
            tx: Some(tx),
        })
    }

    async fn validate(&self, resource: &str, pool: &SqlitePool) -> Result<()> {
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(pool)
                .await
                .map_err(|e| StoreError::unavailable(resource, e.to_string()))?;

        if tables.is_empty() {
            return Err(StoreError::unavailable(resource, "store contains no tables"));
        }

        let descriptor = self.locator.descriptor(resource)?;
        let missing: Vec<&str> = descriptor
            .required_tables
            .iter()
            .filter(|required| !tables.iter().any(|(name,)| name == *required))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(StoreError::unavailable(
                resource,
                format!("missing tables: {}", missing.join(", ")),
            ));
        }
        Ok(())
    }

    /// Run `work` inside a session and close it according to the outcome.
    ///
    /// An error from `work` is logged, the session rolls back, and the error
    /// is returned unchanged.
    ///
    /// ```ignore
    /// let count = store
    ///     .with_session(CATALOG, SessionMode::ReadOnly, |session| {
    ///         Box::pin(async move { session.catalog()?.count_items().await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_session<T, E, F>(
        &self,
        resource: &str,
        mode: SessionMode,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<StoreError> + std::fmt::Display,
    {
        let mut session = self.open(resource, mode).await?;

        match work(&mut session).await {
            Ok(value) => {
                session.close(true).await?;
                Ok(value)
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Session work failed, rolling back");
                if let Err(close_err) = session.close(false).await {
                    warn!(resource = %resource, error = %close_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// An open transaction on one store.
pub struct Session {
    resource: String,
    mode: SessionMode,
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl Session {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// The transaction's connection.
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_mut()
            .map(|tx| &mut **tx)
            .ok_or_else(|| StoreError::IllegalState("session already closed".to_string()))
    }

    pub fn catalog(&mut self) -> Result<CatalogStore<'_>> {
        Ok(CatalogStore::new(self.conn()?))
    }

    /// Close the session. Returns whether anything was committed.
    pub async fn close(mut self, succeeded: bool) -> Result<bool> {
        let Some(mut tx) = self.tx.take() else {
            return Err(StoreError::IllegalState("session already closed".to_string()));
        };

        let committed = if self.mode == SessionMode::Commit && succeeded {
            let (changes,): (i64,) = sqlx::query_as("SELECT total_changes()")
                .fetch_one(&mut *tx)
                .await?;
            if changes > 0 {
                tx.commit().await?;
                true
            } else {
                tx.rollback().await?;
                false
            }
        } else {
            tx.rollback().await?;
            false
        };

        self.pool.close().await;
        debug!(resource = %self.resource, committed, "Session closed");
        Ok(committed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .field("open", &self.tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{StoreDescriptor, CATALOG};
    use crate::schema::initialize_catalog;
    use std::path::Path;

    async fn catalog_store(dir: &Path) -> DataStore {
        let path = dir.join("catalog.db");
        initialize_catalog(&path).await.unwrap();
        DataStore::new(Arc::new(StoreLocator::for_host(path, None, None)))
    }

    async fn insert_view(session: &mut Session, id: &str) -> Result<()> {
        sqlx::query("INSERT INTO library_view (library_id, name, media_type) VALUES (?, 'x', 'movies')")
            .bind(id)
            .execute(session.conn()?)
            .await?;
        Ok(())
    }

    async fn view_count(store: &DataStore) -> i64 {
        store
            .with_session(CATALOG, SessionMode::ReadOnly, |session| {
                Box::pin(async move {
                    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM library_view")
                        .fetch_one(session.conn()?)
                        .await?;
                    Ok::<_, StoreError>(n)
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_mode_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = catalog_store(dir.path()).await;

        let mut session = store.open(CATALOG, SessionMode::Commit).await.unwrap();
        insert_view(&mut session, "lib-1").await.unwrap();
        assert!(session.close(true).await.unwrap());

        assert_eq!(view_count(&store).await, 1);
    }

    #[tokio::test]
    async fn test_unchanged_session_does_not_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = catalog_store(dir.path()).await;

        let session = store.open(CATALOG, SessionMode::Commit).await.unwrap();
        assert!(!session.close(true).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only_and_failed_sessions_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = catalog_store(dir.path()).await;

        let mut session = store.open(CATALOG, SessionMode::ReadOnly).await.unwrap();
        insert_view(&mut session, "lib-1").await.unwrap();
        assert!(!session.close(true).await.unwrap());

        let mut session = store.open(CATALOG, SessionMode::Commit).await.unwrap();
        insert_view(&mut session, "lib-2").await.unwrap();
        assert!(!session.close(false).await.unwrap());

        assert_eq!(view_count(&store).await, 0);
    }

    #[tokio::test]
    async fn test_with_session_error_rolls_back_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = catalog_store(dir.path()).await;

        let result: Result<()> = store
            .with_session(CATALOG, SessionMode::Commit, |session| {
                Box::pin(async move {
                    insert_view(session, "lib-1").await?;
                    Err(StoreError::InvalidArgument("boom".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert_eq!(view_count(&store).await, 0);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = catalog_store(dir.path()).await;

        {
            let mut session = store.open(CATALOG, SessionMode::Commit).await.unwrap();
            insert_view(&mut session, "lib-1").await.unwrap();
        }

        assert_eq!(view_count(&store).await, 0);
    }

    #[tokio::test]
    async fn test_missing_store_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let locator = StoreLocator::for_host(dir.path().join("absent.db"), None, None);
        let store = DataStore::new(Arc::new(locator));

        assert!(matches!(
            store.open(CATALOG, SessionMode::ReadOnly).await,
            Err(StoreError::StoreUnavailable { .. })
        ));
        // Opening must not create the file.
        assert!(!dir.path().join("absent.db").exists());
    }

    #[tokio::test]
    async fn test_store_without_tables_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::write(&path, b"").unwrap();

        let mut locator = StoreLocator::new(None, None);
        locator.register(StoreDescriptor::at_path("empty", &path));
        let store = DataStore::new(Arc::new(locator));

        assert!(matches!(
            store.open("empty", SessionMode::ReadOnly).await,
            Err(StoreError::StoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_required_table_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.db");
        initialize_catalog(&path).await.unwrap();

        let mut locator = StoreLocator::new(None, None);
        locator.register(
            StoreDescriptor::at_path("partial", &path).with_required_tables(&["catalog_item", "tracks"]),
        );
        let store = DataStore::new(Arc::new(locator));

        match store.open("partial", SessionMode::ReadOnly).await {
            Err(StoreError::StoreUnavailable { reason, .. }) => assert!(reason.contains("tracks")),
            other => panic!("expected StoreUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_session_rejects_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = catalog_store(dir.path()).await;

        let mut session = store.open(CATALOG, SessionMode::Commit).await.unwrap();
        session.tx.take();
        assert!(matches!(session.conn(), Err(StoreError::IllegalState(_))));
    }
}
