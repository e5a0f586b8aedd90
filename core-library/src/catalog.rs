//! Catalog read/write primitives.
//!
//! A [`CatalogStore`] borrows the connection of an open
//! [`Session`](crate::session::Session); every write lands in that session's
//! transaction.

use bridge_traits::RemoteItem;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};

use crate::error::Result;

/// One mirrored remote item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CatalogItem {
    pub remote_id: String,
    pub library_id: String,
    pub item_type: String,
    pub media_type: String,
    /// Id of the row the host created for this item, once known.
    pub local_id: Option<i64>,
    pub parent_id: Option<String>,
    pub checksum: Option<String>,
    /// Opaque per-user state (played, favorite, resume position) as JSON.
    pub user_data: Option<String>,
}

impl CatalogItem {
    pub fn from_remote(item: &RemoteItem) -> Self {
        Self {
            remote_id: item.id.clone(),
            library_id: item.library_id.clone(),
            item_type: item.item_type.clone(),
            media_type: item.media_type.clone(),
            local_id: None,
            parent_id: item.parent_id.clone(),
            checksum: item.checksum.clone(),
            user_data: None,
        }
    }
}

/// A synced library as shown in the host's views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LibraryView {
    pub library_id: String,
    pub name: String,
    pub media_type: String,
}

pub struct CatalogStore<'s> {
    conn: &'s mut SqliteConnection,
}

impl<'s> CatalogStore<'s> {
    pub fn new(conn: &'s mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert or update by remote id. Known local ids and user data are kept
    /// when the incoming row does not carry them.
    pub async fn upsert_item(&mut self, item: &CatalogItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO catalog_item (
                remote_id, library_id, item_type, media_type,
                local_id, parent_id, checksum, user_data
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(remote_id) DO UPDATE SET
                library_id = excluded.library_id,
                item_type = excluded.item_type,
                media_type = excluded.media_type,
                local_id = COALESCE(excluded.local_id, catalog_item.local_id),
                parent_id = excluded.parent_id,
                checksum = excluded.checksum,
                user_data = COALESCE(excluded.user_data, catalog_item.user_data),
                updated_at = strftime('%s', 'now')
            "#,
        )
        .bind(&item.remote_id)
        .bind(&item.library_id)
        .bind(&item.item_type)
        .bind(&item.media_type)
        .bind(item.local_id)
        .bind(&item.parent_id)
        .bind(&item.checksum)
        .bind(&item.user_data)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn get_item(&mut self, remote_id: &str) -> Result<Option<CatalogItem>> {
        let item = sqlx::query_as::<_, CatalogItem>(
            r#"
            SELECT remote_id, library_id, item_type, media_type,
                   local_id, parent_id, checksum, user_data
            FROM catalog_item WHERE remote_id = ?
            "#,
        )
        .bind(remote_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(item)
    }

    /// Delete one item, returning the removed row. Artwork rows cascade.
    pub async fn delete_item(&mut self, remote_id: &str) -> Result<Option<CatalogItem>> {
        let Some(item) = self.get_item(remote_id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM catalog_item WHERE remote_id = ?")
            .bind(remote_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(Some(item))
    }

    pub async fn items_in_library(&mut self, library_id: &str) -> Result<Vec<CatalogItem>> {
        let items = sqlx::query_as::<_, CatalogItem>(
            r#"
            SELECT remote_id, library_id, item_type, media_type,
                   local_id, parent_id, checksum, user_data
            FROM catalog_item WHERE library_id = ?
            ORDER BY remote_id
            "#,
        )
        .bind(library_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(items)
    }

    /// Items whose parent is `parent_id` (episodes of a season, tracks of an album).
    pub async fn children_of(&mut self, parent_id: &str) -> Result<Vec<CatalogItem>> {
        let items = sqlx::query_as::<_, CatalogItem>(
            r#"
            SELECT remote_id, library_id, item_type, media_type,
                   local_id, parent_id, checksum, user_data
            FROM catalog_item WHERE parent_id = ?
            ORDER BY remote_id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(items)
    }

    pub async fn delete_library_items(&mut self, library_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM catalog_item WHERE library_id = ?")
            .bind(library_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Replace the stored user data. Returns false if the item is unknown.
    pub async fn set_user_data(&mut self, remote_id: &str, user_data: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE catalog_item SET user_data = ?, updated_at = strftime('%s', 'now') \
             WHERE remote_id = ?",
        )
        .bind(user_data)
        .bind(remote_id)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_items(&mut self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM catalog_item")
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(count)
    }

    pub async fn upsert_view(&mut self, view: &LibraryView) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO library_view (library_id, name, media_type)
            VALUES (?, ?, ?)
            ON CONFLICT(library_id) DO UPDATE SET
                name = excluded.name,
                media_type = excluded.media_type,
                updated_at = strftime('%s', 'now')
            "#,
        )
        .bind(&view.library_id)
        .bind(&view.name)
        .bind(&view.media_type)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn remove_view(&mut self, library_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM library_view WHERE library_id = ?")
            .bind(library_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_views(&mut self) -> Result<Vec<LibraryView>> {
        let views = sqlx::query_as::<_, LibraryView>(
            "SELECT library_id, name, media_type FROM library_view ORDER BY name, library_id",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(views)
    }

    pub async fn upsert_artwork(&mut self, remote_id: &str, kind: &str, url: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artwork (item_remote_id, kind, url) VALUES (?, ?, ?)
            ON CONFLICT(item_remote_id, kind) DO UPDATE SET url = excluded.url
            "#,
        )
        .bind(remote_id)
        .bind(kind)
        .bind(url)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn count_artwork(&mut self, remote_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM artwork WHERE item_remote_id = ?")
                .bind(remote_id)
                .fetch_one(&mut *self.conn)
                .await?;
        Ok(count)
    }
}
