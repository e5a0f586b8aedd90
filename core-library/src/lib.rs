//! # Local Store Module
//!
//! Shared local storage used by the sync service and, externally, by every
//! other process instance of the host application.
//!
//! ## Overview
//!
//! - [`lock::ProcessLock`] - cooperative cross-instance mutual exclusion built on
//!   a shared flag store and polling
//! - [`session::DataStore`] - scoped store sessions with commit-or-rollback on
//!   close
//! - [`locator::StoreLocator`] - maps logical store names to files, discovering
//!   host stores once per process
//! - [`schema`] - catalog migrations, version gate and destructive reset
//! - [`catalog::CatalogStore`] - catalog read/write primitives used by sync
//!
//! No component writes to a store without holding the [`lock::ProcessLock`] for
//! that resource. Reads take no lock and may observe slightly stale data.

pub mod catalog;
pub mod error;
pub mod locator;
pub mod lock;
pub mod schema;
pub mod session;

pub use catalog::{CatalogItem, CatalogStore, LibraryView};
pub use error::{Result, StoreError};
pub use locator::{
    StoreDescriptor, StoreLocation, StoreLocator, ARTWORK_INDEX, CATALOG, MEDIA_INDEX, MUSIC_INDEX,
};
pub use lock::{LockConfig, ProcessLock};
pub use schema::{initialize_catalog, reset_catalog, verify_catalog, CATALOG_SCHEMA_VERSION};
pub use session::{DataStore, Session, SessionMode};
