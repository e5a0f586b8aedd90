//! # Credentials File
//!
//! Known servers live in `data.json` as `{ "Servers": [ { "Id": ... }, ... ] }`.
//! Server records carry connection details owned by the host connector
//! (address, access token, user id); this module only reads and writes them
//! as opaque JSON keyed by `Id`.
//!
//! Installations predating `data.json` kept the same document in `data.txt`.
//! The first read migrates it and deletes the legacy file.

use std::path::PathBuf;

use bridge_desktop::files::{read_json, remove_if_exists, write_json_atomic};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "Servers", default)]
    pub servers: Vec<ServerRecord>,
    /// Top-level fields written by other tools are kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            details: Map::new(),
        }
    }
}

impl Credentials {
    pub fn server(&self, id: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.id == id)
    }
}

/// Serialized access to the credentials file.
pub struct CredentialStore {
    path: PathBuf,
    legacy_path: PathBuf,
    write_guard: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, legacy_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            legacy_path: legacy_path.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// Load the credentials, migrating the legacy file if needed.
    ///
    /// Unreadable documents load as empty credentials.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Credentials> {
        match read_json::<Credentials>(&self.path).await {
            Ok(Some(credentials)) => return Ok(credentials),
            Ok(None) => {}
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Credentials file unreadable, trying legacy file")
            }
        }

        match read_json::<Credentials>(&self.legacy_path).await {
            Ok(Some(credentials)) => {
                write_json_atomic(&self.path, &credentials).await?;
                remove_if_exists(&self.legacy_path).await?;
                info!(servers = credentials.servers.len(), "Migrated legacy credentials file");
                Ok(credentials)
            }
            Ok(None) => Ok(Credentials::default()),
            Err(e) => {
                warn!(path = ?self.legacy_path, error = %e, "Legacy credentials unreadable");
                Ok(Credentials::default())
            }
        }
    }

    pub async fn save(&self, credentials: &Credentials) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        write_json_atomic(&self.path, credentials).await?;
        Ok(())
    }

    /// Add a server record unless one with the same id exists. Returns
    /// whether the file changed.
    pub async fn add_server(&self, id: &str) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let mut credentials = self.load().await?;
        if credentials.server(id).is_some() {
            return Ok(false);
        }
        credentials.servers.push(ServerRecord::new(id));
        write_json_atomic(&self.path, &credentials).await?;
        Ok(true)
    }

    /// Drop a server record. Returns whether one was removed.
    pub async fn remove_server(&self, id: &str) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let mut credentials = self.load().await?;
        let before = credentials.servers.len();
        credentials.servers.retain(|s| s.id != id);
        if credentials.servers.len() == before {
            return Ok(false);
        }
        write_json_atomic(&self.path, &credentials).await?;
        Ok(true)
    }
}
