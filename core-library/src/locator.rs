//! # Store Path Discovery
//!
//! Maps logical store names ("catalog", "media-index", ...) to files.
//!
//! The catalog lives at a configured path. Host-owned index stores are named
//! `<Prefix><schema>.db` inside the host database directory, where the schema
//! number changes across host releases, so they are discovered:
//!
//! 1. Scan the directory for files starting with the prefix, ignoring SQLite
//!    side files (`-wal`, `-shm`, `-journal`). Exactly one match wins.
//! 2. Otherwise read the host log for `Running database version <name>` lines
//!    and take the last one naming this prefix.
//!
//! A successful resolution is cached for the lifetime of the locator, which
//! the service manager keeps for the whole process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// Logical name of the service-owned catalog store.
pub const CATALOG: &str = "catalog";
pub const MEDIA_INDEX: &str = "media-index";
pub const MUSIC_INDEX: &str = "music-index";
pub const ARTWORK_INDEX: &str = "artwork-index";

const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];
const LOG_MARKER: &str = "Running database version ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Path(PathBuf),
    Discover { prefix: String },
}

/// How to find and validate one logical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub name: String,
    pub location: StoreLocation,
    /// Tables that must exist for the store to be considered valid. When
    /// empty, any store with at least one table is accepted.
    pub required_tables: Vec<String>,
}

impl StoreDescriptor {
    pub fn at_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            location: StoreLocation::Path(path.into()),
            required_tables: Vec::new(),
        }
    }

    pub fn discovered(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: StoreLocation::Discover {
                prefix: prefix.into(),
            },
            required_tables: Vec::new(),
        }
    }

    pub fn with_required_tables(mut self, tables: &[&str]) -> Self {
        self.required_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }
}

pub struct StoreLocator {
    database_dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    descriptors: HashMap<String, StoreDescriptor>,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl StoreLocator {
    pub fn new(database_dir: Option<PathBuf>, log_path: Option<PathBuf>) -> Self {
        Self {
            database_dir,
            log_path,
            descriptors: HashMap::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Locator knowing the catalog path and the host index stores.
    pub fn for_host(
        catalog_path: impl Into<PathBuf>,
        database_dir: Option<PathBuf>,
        log_path: Option<PathBuf>,
    ) -> Self {
        let mut locator = Self::new(database_dir, log_path);
        locator.register(
            StoreDescriptor::at_path(CATALOG, catalog_path)
                .with_required_tables(crate::schema::CATALOG_TABLES),
        );
        locator.register(StoreDescriptor::discovered(MEDIA_INDEX, "MyVideos"));
        locator.register(StoreDescriptor::discovered(MUSIC_INDEX, "MyMusic"));
        locator.register(StoreDescriptor::discovered(ARTWORK_INDEX, "Textures"));
        locator
    }

    pub fn register(&mut self, descriptor: StoreDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn descriptor(&self, name: &str) -> Result<&StoreDescriptor> {
        self.descriptors
            .get(name)
            .ok_or_else(|| StoreError::unavailable(name, "no store registered under this name"))
    }

    /// Resolve `name` to a file path, discovering it on first use.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf> {
        if let Some(path) = self.cached(name) {
            return Ok(path);
        }

        let descriptor = self.descriptor(name)?;
        let path = match &descriptor.location {
            StoreLocation::Path(path) => path.clone(),
            StoreLocation::Discover { prefix } => self.discover(name, prefix).await?,
        };

        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.insert(name.to_string(), path.clone());
        }
        Ok(path)
    }

    fn cached(&self, name: &str) -> Option<PathBuf> {
        self.resolved
            .lock()
            .ok()
            .and_then(|resolved| resolved.get(name).cloned())
    }

    async fn discover(&self, name: &str, prefix: &str) -> Result<PathBuf> {
        let dir = self
            .database_dir
            .as_deref()
            .ok_or_else(|| StoreError::unavailable(name, "no host database directory configured"))?;

        let candidates = scan_directory(dir, prefix).await?;
        if let [only] = candidates.as_slice() {
            info!(store = name, path = ?only, "Discovered store from database directory");
            return Ok(only.clone());
        }

        debug!(
            store = name,
            candidates = candidates.len(),
            "Directory scan ambiguous, consulting host log"
        );

        if let Some(log_path) = &self.log_path {
            match tokio::fs::read_to_string(log_path).await {
                Ok(log) => {
                    if let Some(db_name) = latest_logged_database(&log, prefix) {
                        let path = dir.join(format!("{}.db", db_name));
                        info!(store = name, path = ?path, "Discovered store from host log");
                        return Ok(path);
                    }
                }
                Err(e) => warn!(store = name, error = %e, "Failed to read host log"),
            }
        }

        Err(StoreError::unavailable(
            name,
            format!(
                "could not locate a '{}' store ({} candidates in {})",
                prefix,
                candidates.len(),
                dir.display()
            ),
        ))
    }
}

async fn scan_directory(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Bridge(e.into())),
    };

    let mut matches = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::Bridge(e.into()))?
    {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(prefix)
            && !SIDE_FILE_SUFFIXES.iter().any(|s| file_name.ends_with(s))
        {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Name of the most recently logged database matching `prefix`.
fn latest_logged_database(log: &str, prefix: &str) -> Option<String> {
    log.lines()
        .filter_map(|line| line.rsplit_once(LOG_MARKER).map(|(_, name)| name.trim()))
        .filter(|name| name.starts_with(prefix))
        .last()
        .map(str::to_string)
}
