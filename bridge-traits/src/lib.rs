//! # Host Bridge Traits
//!
//! Capabilities the sync core needs from its host but never implements itself.
//!
//! ## Traits
//!
//! ### Shared state
//! - [`SharedFlagStore`](flags::SharedFlagStore) - Boolean flags visible to every
//!   process instance of the host application. The only primitive the
//!   cross-instance lock is built on.
//!
//! ### Remote server
//! - [`ServerConnector`](server::ServerConnector) - Connect, authenticate and close
//!   sessions to a media server
//! - [`MediaServer`](server::MediaServer) - Outbound calls made while syncing
//!   (`get_device`, `refresh_item`, `delete_item`, item listing)
//! - [`PushChannel`](host::PushChannel) - Liveness of the server push transport
//!
//! ### Host application
//! - [`HostApplication`](host::HostApplication) - Active profile, user confirmation
//!   prompts and user-visible notifications
//! - [`PlaybackMonitor`](host::PlaybackMonitor) - Whether media is currently playing
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Every trait reports failures through [`BridgeError`](error::BridgeError).
//! Implementations convert host-specific failures into it and keep the message
//! actionable (resource name, server id, path).
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; the core shares bridge handles across
//! background tasks behind `Arc<dyn Trait>`.

pub mod error;
pub mod flags;
pub mod host;
pub mod server;
pub mod time;

pub use error::{BridgeError, Result};
pub use flags::SharedFlagStore;
pub use host::{HostApplication, NotificationLevel, PlaybackMonitor, PushChannel};
pub use server::{
    ConnectionOutcome, DeviceInfo, ItemPage, MediaServer, RemoteItem, RemoteLibrary, ServerConnector,
    SignedInSession,
};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, SystemClock};
