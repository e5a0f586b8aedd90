use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The store file is missing, malformed, or could not be opened in time.
    #[error("Store '{resource}' unavailable: {reason}")]
    StoreUnavailable { resource: String, reason: String },

    #[error("Timed out waiting for lock on '{resource}'")]
    LockTimeout { resource: String },

    /// Lock protocol violated by the caller.
    #[error("Illegal lock state: {0}")]
    IllegalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Catalog schema {found} is older than the minimum supported {minimum}")]
    SchemaTooOld { found: String, minimum: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub(crate) fn unavailable(resource: &str, reason: impl Into<String>) -> Self {
        StoreError::StoreUnavailable {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
