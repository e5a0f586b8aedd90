//! # Library Sync Module
//!
//! Mirrors the libraries a user selected on the media server into the local
//! catalog and keeps them current.
//!
//! ## Components
//!
//! - **Orchestrator** (`orchestrator`): full and incremental batches, removals,
//!   user data, deferred verification and the lock-timeout retry pass
//! - **Checkpoint** (`checkpoint`): the `sync.json` selection and restore
//!   points
//! - **Selection** (`selection`): library selection actions and id parsing
//! - **Verify queue** (`verify`): items whose removal waits for a delayed
//!   existence check

pub mod checkpoint;
pub mod error;
pub mod orchestrator;
pub mod selection;
pub mod verify;

pub use checkpoint::{CheckpointFile, SyncCheckpoint};
pub use error::{Result, SyncError};
pub use orchestrator::{
    BatchOutcome, SyncConfig, SyncDeps, SyncOrchestrator, UserDataChange, ALL_LIBRARIES,
};
pub use selection::{split_library_ids, SelectionAction};
pub use verify::VerifyQueue;
