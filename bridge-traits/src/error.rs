use thiserror::Error;

/// Failure reported by a host bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The host cannot provide this capability right now (offline server,
    /// unknown library).
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// The shared flag store could not be opened, read or written.
    #[error("Flag store error: {0}")]
    FlagStore(String),

    /// A persisted file exists but does not decode.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
