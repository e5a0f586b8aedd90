//! # Desktop Bridge Implementations
//!
//! Default implementations of the storage-facing bridge traits for desktop
//! hosts.
//!
//! - [`SqliteFlagStore`] - `SharedFlagStore` backed by a small SQLite file that
//!   every process instance opens; atomic test-and-set via a conditional upsert
//! - [`InMemoryFlagStore`] - `SharedFlagStore` for hosts that run every
//!   participant inside one process, and for tests
//! - [`files`] - JSON state files written through temp file + rename
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::SqliteFlagStore;
//! use bridge_traits::SharedFlagStore;
//!
//! let flags = SqliteFlagStore::new(data_dir.join("flags.db")).await?;
//! assert!(flags.try_set_flag("lock.catalog.held").await?);
//! ```

pub mod files;
mod flags;
mod memory;

pub use flags::SqliteFlagStore;
pub use memory::InMemoryFlagStore;
