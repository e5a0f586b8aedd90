//! # Sync Checkpoint File
//!
//! `sync.json` persists the library selection and per-library restore points:
//!
//! ```json
//! {
//!     "Date": "2024-05-01T12:00:00Z",
//!     "Libraries": ["<library id still being synced>"],
//!     "RestorePoint": { "<library id>": "<server cursor>" },
//!     "SortedViews": ["<library id in display order>"],
//!     "Whitelist": ["<selected library id>"]
//! }
//! ```
//!
//! A missing or corrupt file loads as an empty checkpoint. Every save stamps
//! `Date` and replaces the file atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bridge_desktop::files::{read_json, remove_if_exists, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncCheckpoint {
    /// Libraries with a full sync that has not finished yet.
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Last committed server cursor per library.
    #[serde(default)]
    pub restore_point: BTreeMap<String, String>,
    /// The library selection.
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub sorted_views: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SyncCheckpoint {
    pub fn is_selected(&self, library_id: &str) -> bool {
        self.whitelist.iter().any(|id| id == library_id)
    }

    pub fn select(&mut self, library_id: &str) {
        if !self.is_selected(library_id) {
            self.whitelist.push(library_id.to_string());
        }
        if !self.sorted_views.iter().any(|id| id == library_id) {
            self.sorted_views.push(library_id.to_string());
        }
    }

    pub fn mark_pending(&mut self, library_id: &str) {
        if !self.libraries.iter().any(|id| id == library_id) {
            self.libraries.push(library_id.to_string());
        }
    }

    /// Record a fully committed batch: advance the restore point and drop the
    /// library from the pending list.
    pub fn complete(&mut self, library_id: &str, cursor: String) {
        self.restore_point.insert(library_id.to_string(), cursor);
        self.libraries.retain(|id| id != library_id);
    }

    /// Forget everything about a library.
    pub fn forget(&mut self, library_id: &str) {
        self.libraries.retain(|id| id != library_id);
        self.whitelist.retain(|id| id != library_id);
        self.sorted_views.retain(|id| id != library_id);
        self.restore_point.remove(library_id);
    }

    fn dedupe_whitelist(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.whitelist.retain(|id| seen.insert(id.clone()));
    }
}

pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn load(&self) -> SyncCheckpoint {
        let mut checkpoint = match read_json::<SyncCheckpoint>(&self.path).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => SyncCheckpoint::default(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Sync checkpoint unreadable, starting fresh");
                SyncCheckpoint::default()
            }
        };
        checkpoint.dedupe_whitelist();
        checkpoint
    }

    pub async fn save(&self, checkpoint: &mut SyncCheckpoint, now: DateTime<Utc>) -> Result<()> {
        checkpoint.date = Some(now.format(DATE_FORMAT).to_string());
        write_json_atomic(&self.path, checkpoint)
            .await
            .map_err(|e| SyncError::Checkpoint(e.to_string()))?;
        debug!(path = ?self.path, "Sync checkpoint saved");
        Ok(())
    }

    pub async fn delete(&self) -> Result<bool> {
        remove_if_exists(&self.path)
            .await
            .map_err(|e| SyncError::Checkpoint(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_missing_and_corrupt_files_load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = CheckpointFile::new(dir.path().join("sync.json"));
        assert_eq!(file.load().await, SyncCheckpoint::default());

        std::fs::write(file.path(), b"{ not json").unwrap();
        assert_eq!(file.load().await, SyncCheckpoint::default());
    }

    #[tokio::test]
    async fn test_whitelist_is_deduplicated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = CheckpointFile::new(dir.path().join("sync.json"));
        std::fs::write(file.path(), r#"{"Whitelist":["a","b","a"]}"#).unwrap();

        let checkpoint = file.load().await;
        assert_eq!(checkpoint.whitelist, vec!["a".to_string(), "b".to_string()]);
        assert!(checkpoint.restore_point.is_empty());
    }

    #[tokio::test]
    async fn test_save_stamps_date_and_sorts_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = CheckpointFile::new(dir.path().join("sync.json"));
        let mut checkpoint = SyncCheckpoint::default();
        checkpoint.select("lib");
        checkpoint.mark_pending("lib");
        checkpoint.complete("lib", "cursor-1".to_string());

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        file.save(&mut checkpoint, now).await.unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("\"Date\": \"2024-05-01T12:00:00Z\""));
        let date = text.find("\"Date\"").unwrap();
        let whitelist = text.find("\"Whitelist\"").unwrap();
        assert!(date < whitelist);

        let loaded = file.load().await;
        assert_eq!(loaded.restore_point.get("lib").map(String::as_str), Some("cursor-1"));
        assert!(loaded.libraries.is_empty());
    }

    #[test]
    fn test_forget_clears_library() {
        let mut checkpoint = SyncCheckpoint::default();
        checkpoint.select("a");
        checkpoint.mark_pending("a");
        checkpoint.restore_point.insert("a".to_string(), "c".to_string());

        checkpoint.forget("a");

        assert!(!checkpoint.is_selected("a"));
        assert!(checkpoint.libraries.is_empty());
        assert!(checkpoint.sorted_views.is_empty());
        assert!(checkpoint.restore_point.is_empty());
    }
}
