//! # Background Service
//!
//! Wires the connection supervisor, the library sync orchestrator and the
//! notification router into one long-running service.
//!
//! ## Overview
//!
//! - [`ServiceManager`] - owns the service across restarts; hosts talk to it
//!   through a [`ServiceHandle`]
//! - [`ServiceLoop`] - one run: startup checks, the poll loop and teardown
//! - [`NotificationRouter`] - decodes host and plugin notifications and
//!   dispatches them on per-server lanes
//! - [`handlers`] - what each notification does
//!
//! ## Example
//!
//! ```ignore
//! use core_service::{ServiceManager, ExitReason};
//!
//! let manager = ServiceManager::new(config);
//! let handle = manager.handle();
//! tokio::spawn(async move {
//!     handle.notify("SyncLibrary", r#"[{"Id": "lib-1"}]"#);
//! });
//! let reason: ExitReason = manager.run().await?;
//! ```

pub mod context;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod router;
pub mod service_loop;

pub use context::{HandlerSignals, LoopSignals, ServiceContext};
pub use error::{ExitReason, RestartReason, Result, ServiceError, Termination};
pub use handlers::ServiceHandlers;
pub use manager::{ServiceHandle, ServiceManager};
pub use router::{
    HandlerTable, Method, Notification, NotificationRouter, NotificationSource, RoutedEvent,
    Submission,
};
pub use service_loop::{LoopConfig, ServiceLoop};
