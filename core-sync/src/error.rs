use bridge_traits::error::BridgeError;
use core_library::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Server(#[from] BridgeError),

    #[error("Sync checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Library sync is not started")]
    NotStarted,

    #[error("Sync stopped before library {library_id} finished")]
    Stopped { library_id: String },
}

impl SyncError {
    /// Lock contention that the retry pass may resolve.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::LockTimeout { .. }))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
