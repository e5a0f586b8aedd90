//! Catalog schema: migrations, the version gate and destructive reset.

use std::path::Path;

use semver::Version;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::locator::CATALOG;
use crate::session::{DataStore, SessionMode};

/// Schema version written by this build.
pub const CATALOG_SCHEMA_VERSION: &str = "3.1.0";

/// Tables a valid catalog must contain.
pub const CATALOG_TABLES: &[&str] = &["catalog_item", "library_view", "artwork", "schema_version"];

/// Create the catalog file if needed and apply pending migrations.
///
/// A freshly created catalog is stamped with [`CATALOG_SCHEMA_VERSION`]; an
/// existing stamp is left alone so the version gate can see it.
pub async fn initialize_catalog(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Bridge(e.into()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            warn!(error = %e, "Catalog migration failed");
            StoreError::Migration(e.to_string())
        })?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, ?)")
        .bind(CATALOG_SCHEMA_VERSION)
        .execute(&pool)
        .await?;

    pool.close().await;
    info!(path = ?path, "Catalog initialized");
    Ok(())
}

pub async fn read_schema_version(conn: &mut SqliteConnection) -> Result<Option<String>> {
    let version: Option<(String,)> = sqlx::query_as("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(conn)
        .await?;
    Ok(version.map(|(v,)| v))
}

pub async fn write_schema_version(conn: &mut SqliteConnection, version: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO schema_version (id, version) VALUES (1, ?) \
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, \
         updated_at = strftime('%s', 'now')",
    )
    .bind(version)
    .execute(conn)
    .await?;
    Ok(())
}

/// Fails with [`StoreError::SchemaTooOld`] when `found` predates `minimum`.
///
/// A missing or unparseable stamp counts as too old.
pub fn check_schema_version(found: Option<&str>, minimum: &str) -> Result<()> {
    let minimum_version = Version::parse(minimum).map_err(|e| {
        StoreError::InvalidArgument(format!("minimum schema version '{}': {}", minimum, e))
    })?;

    let too_old = || StoreError::SchemaTooOld {
        found: found.unwrap_or("none").to_string(),
        minimum: minimum.to_string(),
    };

    match found.map(Version::parse) {
        Some(Ok(found_version)) if found_version >= minimum_version => Ok(()),
        _ => Err(too_old()),
    }
}

/// Read the catalog's stamp and apply the version gate.
pub async fn verify_catalog(store: &DataStore, minimum: &str) -> Result<()> {
    let minimum = minimum.to_string();
    let found = store
        .with_session(CATALOG, SessionMode::ReadOnly, |session| {
            Box::pin(async move { read_schema_version(session.conn()?).await })
        })
        .await?;
    check_schema_version(found.as_deref(), &minimum)
}

/// Delete every catalog row and restamp the current version.
///
/// Destructive. Callers hold the catalog lock and have the user's
/// confirmation.
pub async fn reset_catalog(conn: &mut SqliteConnection) -> Result<()> {
    warn!("Resetting catalog");
    for table in ["artwork", "catalog_item", "library_view"] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *conn)
            .await?;
    }
    write_schema_version(conn, CATALOG_SCHEMA_VERSION).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        assert!(check_schema_version(Some("3.1.0"), "3.1.0").is_ok());
        assert!(check_schema_version(Some("4.0.2"), "3.1.0").is_ok());

        match check_schema_version(Some("3.0.9"), "3.1.0") {
            Err(StoreError::SchemaTooOld { found, minimum }) => {
                assert_eq!(found, "3.0.9");
                assert_eq!(minimum, "3.1.0");
            }
            other => panic!("expected SchemaTooOld, got {:?}", other),
        }

        assert!(matches!(
            check_schema_version(None, "3.1.0"),
            Err(StoreError::SchemaTooOld { .. })
        ));
        assert!(matches!(
            check_schema_version(Some("garbage"), "3.1.0"),
            Err(StoreError::SchemaTooOld { .. })
        ));
        assert!(matches!(
            check_schema_version(Some("3.1.0"), "x"),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
