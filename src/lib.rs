//! Workspace entry crate.
//!
//! Re-exports the background service so hosts can depend on `media-mirror`
//! and pick bridge defaults through features instead of wiring each crate.
//!
//! - `desktop-shims` (default) - SQLite-backed shared flags and file helpers
//!   from `bridge-desktop`

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
