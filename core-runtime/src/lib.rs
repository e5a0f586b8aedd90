//! # Core Runtime Module
//!
//! Foundational infrastructure shared by every service component:
//! - Logging and tracing bootstrap
//! - Service configuration (bridges + timing policy)
//! - Event bus carrying connection, library, playback and service events
//! - Resettable signals shared between components

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod signals;

pub use error::{Error, Result};
pub use signals::{Flag, FlagReader};
