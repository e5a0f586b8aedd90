//! JSON state files
//!
//! Small documents (sync checkpoint, credentials) that must never be observed
//! half-written. Writes go to a temporary file in the target directory and
//! are renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};

use bridge_traits::error::{BridgeError, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

/// Read and decode a JSON file.
///
/// Returns `Ok(None)` when the file does not exist. Decode failures are
/// errors; callers decide whether a corrupt file falls back to defaults.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BridgeError::Io(e)),
    };

    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        BridgeError::InvalidData(format!("Invalid JSON in {}: {}", path.display(), e))
    })
}

/// Write `value` as pretty printed JSON with sorted object keys.
///
/// The document is written to a sibling temporary file, flushed and renamed
/// over `path`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    // Round-tripping through `Value` sorts object keys.
    let document = serde_json::to_value(value)
        .and_then(|v| serde_json::to_vec_pretty(&v))
        .map_err(|e| BridgeError::InvalidData(format!("Failed to encode JSON: {}", e)))?;

    let target: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || persist(&target, &document))
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Writer task failed: {}", e)))??;

    debug!(path = ?path, "Wrote JSON state file");
    Ok(())
}

fn persist(target: &Path, document: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(document)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| BridgeError::Io(e.error))?;
    Ok(())
}

/// Delete a file, treating a missing file as success.
///
/// Returns whether a file was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to remove file");
            Err(BridgeError::Io(e))
        }
    }
}
