//! # Server Connection Module
//!
//! Keeps the service connected to its media servers.
//!
//! ## Overview
//!
//! - [`ConnectionSupervisor`] - per-server connection state machine with
//!   single-flight attempts, flat retry on outages and a once-per-window
//!   retry on rejected credentials
//! - [`CredentialStore`] - the `data.json` server list, migrated from the
//!   legacy `data.txt` on first read
//! - [`ServerSlot`] - the default server or a named one
//!
//! State transitions are published on the core event bus; the service loop
//! starts and stops library sync in response.

pub mod credentials;
pub mod error;
pub mod supervisor;
pub mod types;

pub use credentials::{CredentialStore, Credentials, ServerRecord};
pub use error::{ConnectionError, Result};
pub use supervisor::{ConnectionSupervisor, RetryPolicy};
pub use types::{ConnectionState, ServerSlot};
