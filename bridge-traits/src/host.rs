//! Host Application Ports
//!
//! Capabilities owned by the host media application: the active user
//! profile, modal confirmation, user-visible notifications and playback state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Severity of a user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Host application integration.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::host::{HostApplication, NotificationLevel};
///
/// async fn warn_offline(host: &dyn HostApplication) {
///     host.notify("Server", "Server is unreachable", NotificationLevel::Warning)
///         .await
///         .ok();
/// }
/// ```
#[async_trait]
pub trait HostApplication: Send + Sync {
    /// Identifier of the user profile currently active in the host.
    async fn current_profile(&self) -> Result<String>;

    /// Ask the user a yes/no question. Returns `true` on confirmation.
    async fn confirm(&self, heading: &str, message: &str) -> bool;

    /// Surface a status message to the user.
    async fn notify(&self, heading: &str, message: &str, level: NotificationLevel) -> Result<()>;
}

/// Playback state of the host player.
#[async_trait]
pub trait PlaybackMonitor: Send + Sync {
    async fn is_playing(&self) -> bool;
}

/// Liveness of the server push channel (websocket).
pub trait PushChannel: Send + Sync {
    fn is_alive(&self) -> bool;
}
