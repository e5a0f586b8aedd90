use std::fmt;

use bridge_traits::BridgeError;
use core_auth::ConnectionError;
use core_library::StoreError;
use core_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Malformed {method} payload: {reason}")]
    MalformedPayload { method: String, reason: String },

    #[error("Handler for {method} panicked")]
    HandlerPanicked { method: String },
}

impl ServiceError {
    pub(crate) fn malformed(method: impl Into<String>, reason: impl fmt::Display) -> Self {
        ServiceError::MalformedPayload {
            method: method.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Why the service stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The host is quitting.
    Quit,
    /// The host switched to another user profile.
    ProfileSwitched,
    /// The host aborted the service.
    Aborted,
}

/// Why the service tears everything down and starts again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The push channel died while signed in.
    PushChannelLost,
    /// The catalog was reset after the user confirmed it.
    CatalogReset,
}

/// Outcome of one service run, consumed by the
/// [`ServiceManager`](crate::manager::ServiceManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exit(ExitReason),
    Restart(RestartReason),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ExitReason::Quit => "host quit",
            ExitReason::ProfileSwitched => "profile switched",
            ExitReason::Aborted => "aborted",
        };
        f.write_str(reason)
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RestartReason::PushChannelLost => "push channel lost",
            RestartReason::CatalogReset => "catalog reset",
        };
        f.write_str(reason)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exit(reason) => write!(f, "exit ({})", reason),
            Termination::Restart(reason) => write!(f, "restart ({})", reason),
        }
    }
}
