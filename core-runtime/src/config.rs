//! # Service Configuration
//!
//! Everything the background service needs at construction: host bridges,
//! on-disk locations and the timing policy of the connection and sync state
//! machines.
//!
//! ## Required Dependencies
//!
//! - `ServerConnector` - connect/authenticate sessions
//! - `MediaServer` - catalog calls made while syncing
//! - `HostApplication` - profile, confirmation prompts, notifications
//! - `PlaybackMonitor` - drives the progress timers
//! - `PushChannel` - liveness of the server push transport
//! - `SharedFlagStore` - cross-instance lock flags
//!
//! With the `desktop-shims` feature a `SqliteFlagStore` under the data
//! directory is injected when no flag store is provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::ServiceConfig;
//!
//! let config = ServiceConfig::builder()
//!     .data_dir("/home/me/.media-mirror")
//!     .catalog_path("/home/me/.media-mirror/catalog.db")
//!     .device_id("living-room")
//!     .server_connector(connector)
//!     .media_server(server)
//!     .host(host)
//!     .playback_monitor(player)
//!     .push_channel(websocket)
//!     .build()?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{
    Clock, HostApplication, LoggerSink, MediaServer, PlaybackMonitor, PushChannel,
    ServerConnector, SharedFlagStore, SystemClock,
};

use crate::error::{Error, Result};

/// Lowest catalog schema version the service can open without a reset.
pub const DEFAULT_MINIMUM_SCHEMA_VERSION: &str = "3.1.0";

/// Timing policy for the service state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTimings {
    /// Cadence of the top-level polling loop.
    pub poll_interval: Duration,
    /// Minimum spacing between playback position updates.
    pub progress_update_interval: Duration,
    /// Minimum spacing between full progress reports.
    pub progress_report_interval: Duration,
    /// Flat retry delay after the server became unreachable.
    pub unreachable_retry_delay: Duration,
    /// Retry delay after an authorization failure.
    pub unauthorized_retry_delay: Duration,
    /// Wait after host wake before reconnecting.
    pub wake_settle_delay: Duration,
    /// Delay before the first connection attempt.
    pub startup_delay: Duration,
    pub lock_initial_delay: Duration,
    pub lock_max_delay: Duration,
    /// Bounded wait for the catalog lock before a request is queued.
    pub catalog_lock_wait: Duration,
    pub store_open_timeout: Duration,
    /// Age an uncertain item must reach before its existence is checked.
    pub verify_delay: Duration,
    /// How long a destructive reset waits for running syncs to drain.
    pub reset_drain_wait: Duration,
}

impl Default for ServiceTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            progress_update_interval: Duration::from_secs(4),
            progress_report_interval: Duration::from_secs(40),
            unreachable_retry_delay: Duration::from_secs(20),
            unauthorized_retry_delay: Duration::from_secs(120),
            wake_settle_delay: Duration::from_secs(10),
            startup_delay: Duration::ZERO,
            lock_initial_delay: Duration::from_micros(500),
            lock_max_delay: Duration::from_millis(15),
            catalog_lock_wait: Duration::from_secs(30),
            store_open_timeout: Duration::from_secs(120),
            verify_delay: Duration::from_secs(60),
            reset_drain_wait: Duration::from_secs(10),
        }
    }
}

/// Complete service configuration.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Directory holding `sync.json`, `data.json` and the legacy `data.txt`.
    pub data_dir: PathBuf,
    /// The catalog store owned by the service.
    pub catalog_path: PathBuf,
    /// Host database directory scanned to locate the index stores.
    pub host_database_dir: Option<PathBuf>,
    /// Host log scanned when directory discovery is ambiguous.
    pub host_log_path: Option<PathBuf>,
    /// This client's device id on the server.
    pub device_id: String,
    /// Items requested per page during a library pass.
    pub page_size: usize,
    pub minimum_schema_version: String,
    pub timings: ServiceTimings,

    pub server_connector: Arc<dyn ServerConnector>,
    pub media_server: Arc<dyn MediaServer>,
    pub host: Arc<dyn HostApplication>,
    pub playback_monitor: Arc<dyn PlaybackMonitor>,
    pub push_channel: Arc<dyn PushChannel>,
    pub flag_store: Arc<dyn SharedFlagStore>,
    pub clock: Arc<dyn Clock>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("data_dir", &self.data_dir)
            .field("catalog_path", &self.catalog_path)
            .field("host_database_dir", &self.host_database_dir)
            .field("host_log_path", &self.host_log_path)
            .field("device_id", &self.device_id)
            .field("page_size", &self.page_size)
            .field("minimum_schema_version", &self.minimum_schema_version)
            .field("timings", &self.timings)
            .field("logger_sink", &self.logger_sink.is_some())
            .finish_non_exhaustive()
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    pub fn sync_checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("sync.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("data.json")
    }

    pub fn legacy_credentials_path(&self) -> PathBuf {
        self.data_dir.join("data.txt")
    }

    /// Validates paths, the schema version and the timing policy.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        if self.catalog_path.as_os_str().is_empty() {
            return Err(Error::Config("Catalog path cannot be empty".to_string()));
        }

        if self.device_id.trim().is_empty() {
            return Err(Error::Config("Device id cannot be empty".to_string()));
        }

        if self.page_size == 0 {
            return Err(Error::Config("Page size must be greater than 0".to_string()));
        }

        semver::Version::parse(&self.minimum_schema_version).map_err(|e| {
            Error::Config(format!(
                "Minimum schema version '{}' is not a valid version: {}",
                self.minimum_schema_version, e
            ))
        })?;

        let t = &self.timings;
        if t.poll_interval.is_zero() {
            return Err(Error::Config("Poll interval must be greater than 0".to_string()));
        }

        if t.progress_update_interval > t.progress_report_interval {
            return Err(Error::Config(
                "Progress update interval cannot exceed the progress report interval".to_string(),
            ));
        }

        if t.lock_initial_delay.is_zero() || t.lock_initial_delay > t.lock_max_delay {
            return Err(Error::Config(
                "Lock initial delay must be non-zero and not exceed the lock max delay"
                    .to_string(),
            ));
        }

        if t.store_open_timeout.is_zero() {
            return Err(Error::Config(
                "Store open timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn capability_missing(capability: &str, message: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: message.to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_flag_store(data_dir: &std::path::Path) -> Result<Arc<dyn SharedFlagStore>> {
    use bridge_desktop::SqliteFlagStore;
    use tokio::runtime::{Builder, Handle};

    let path = data_dir.join("flags.db");
    let init_store = move || -> Result<SqliteFlagStore> {
        let runtime = Builder::new_current_thread().enable_all().build().map_err(|e| {
            Error::Internal(format!(
                "Failed to create runtime for default flag store: {}",
                e
            ))
        })?;
        Ok(runtime.block_on(SqliteFlagStore::new(path))?)
    };

    // block_on panics inside a runtime; hop to a plain thread in that case.
    let store = match Handle::try_current() {
        Ok(_) => std::thread::spawn(init_store).join().map_err(|_| {
            Error::Internal("Flag store initialization thread panicked".to_string())
        })??,
        Err(_) => init_store()?,
    };

    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_flag_store(_data_dir: &std::path::Path) -> Result<Arc<dyn SharedFlagStore>> {
    Err(capability_missing(
        "SharedFlagStore",
        "A flag store visible to every process instance is required for the catalog lock. \
         Desktop: enable the 'desktop-shims' feature to use SqliteFlagStore.",
    ))
}

/// Builder for [`ServiceConfig`].
#[derive(Default)]
pub struct ServiceConfigBuilder {
    data_dir: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    host_database_dir: Option<PathBuf>,
    host_log_path: Option<PathBuf>,
    device_id: Option<String>,
    page_size: Option<usize>,
    minimum_schema_version: Option<String>,
    timings: Option<ServiceTimings>,
    server_connector: Option<Arc<dyn ServerConnector>>,
    media_server: Option<Arc<dyn MediaServer>>,
    host: Option<Arc<dyn HostApplication>>,
    playback_monitor: Option<Arc<dyn PlaybackMonitor>>,
    push_channel: Option<Arc<dyn PushChannel>>,
    flag_store: Option<Arc<dyn SharedFlagStore>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
}

impl ServiceConfigBuilder {
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn catalog_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn host_database_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.host_database_dir = Some(path.into());
        self
    }

    pub fn host_log_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.host_log_path = Some(path.into());
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn minimum_schema_version(mut self, version: impl Into<String>) -> Self {
        self.minimum_schema_version = Some(version.into());
        self
    }

    pub fn timings(mut self, timings: ServiceTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn server_connector(mut self, connector: Arc<dyn ServerConnector>) -> Self {
        self.server_connector = Some(connector);
        self
    }

    pub fn media_server(mut self, server: Arc<dyn MediaServer>) -> Self {
        self.media_server = Some(server);
        self
    }

    pub fn host(mut self, host: Arc<dyn HostApplication>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn playback_monitor(mut self, monitor: Arc<dyn PlaybackMonitor>) -> Self {
        self.playback_monitor = Some(monitor);
        self
    }

    pub fn push_channel(mut self, channel: Arc<dyn PushChannel>) -> Self {
        self.push_channel = Some(channel);
        self
    }

    pub fn flag_store(mut self, store: Arc<dyn SharedFlagStore>) -> Self {
        self.flag_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ServiceConfig> {
        let data_dir = self.data_dir.ok_or_else(|| {
            Error::Config("Data directory is required. Use .data_dir() to set it.".to_string())
        })?;

        let catalog_path = self
            .catalog_path
            .unwrap_or_else(|| data_dir.join("catalog.db"));

        let device_id = self.device_id.ok_or_else(|| {
            Error::Config("Device id is required. Use .device_id() to set it.".to_string())
        })?;

        let server_connector = self.server_connector.ok_or_else(|| {
            capability_missing(
                "ServerConnector",
                "Inject the host's server client to connect and authenticate sessions.",
            )
        })?;

        let media_server = self.media_server.ok_or_else(|| {
            capability_missing(
                "MediaServer",
                "Inject the host's server client to fetch catalog items.",
            )
        })?;

        let host = self.host.ok_or_else(|| {
            capability_missing(
                "HostApplication",
                "Inject the host integration for profiles, prompts and notifications.",
            )
        })?;

        let playback_monitor = self.playback_monitor.ok_or_else(|| {
            capability_missing("PlaybackMonitor", "Inject the host player state.")
        })?;

        let push_channel = self.push_channel.ok_or_else(|| {
            capability_missing("PushChannel", "Inject the server push transport.")
        })?;

        let flag_store = match self.flag_store {
            Some(store) => store,
            None => provide_default_flag_store(&data_dir)?,
        };

        let config = ServiceConfig {
            data_dir,
            catalog_path,
            host_database_dir: self.host_database_dir,
            host_log_path: self.host_log_path,
            device_id,
            page_size: self.page_size.unwrap_or(200),
            minimum_schema_version: self
                .minimum_schema_version
                .unwrap_or_else(|| DEFAULT_MINIMUM_SCHEMA_VERSION.to_string()),
            timings: self.timings.unwrap_or_default(),
            server_connector,
            media_server,
            host,
            playback_monitor,
            push_channel,
            flag_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
        };

        config.validate()?;

        Ok(config)
    }
}
