//! Remote Media Server Ports
//!
//! The HTTP/WebSocket client is a host collaborator. The core only sees the
//! outcome of a connection attempt and a handful of catalog calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Session details reported by a successful sign in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedInSession {
    pub server_id: String,
    pub user_id: String,
    pub server_name: Option<String>,
}

/// Result of a single connect + authenticate attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    SignedIn(SignedInSession),
    Unreachable,
    Unauthorized,
}

/// Connects to and disconnects from media servers.
///
/// `server_id` of `None` designates the default server stored in the
/// credentials file.
///
/// Implementations must return promptly when the future is dropped; the
/// supervisor cancels attempts by dropping them on abort.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self, server_id: Option<&str>) -> Result<ConnectionOutcome>;

    /// Close the session to one server.
    async fn close(&self, server_id: Option<&str>) -> Result<()>;

    /// Close every open session.
    async fn close_all(&self) -> Result<()>;
}

/// Remote device/session registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub user_id: Option<String>,
    pub supports_remote_control: bool,
}

/// A catalog item as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub library_id: String,
    pub item_type: String,
    pub media_type: String,
    pub parent_id: Option<String>,
    pub checksum: Option<String>,
}

/// A library (view) as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLibrary {
    pub id: String,
    pub name: String,
    pub media_type: String,
}

/// One page of a library listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPage {
    pub items: Vec<RemoteItem>,
    /// Total number of items matching the query across all pages.
    pub total: usize,
    /// Server-side position to resume from on the next incremental pass.
    pub cursor: String,
}

/// Outbound catalog calls made while synchronizing.
#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn get_device(&self, device_id: &str) -> Result<DeviceInfo>;

    async fn refresh_item(&self, item_id: &str) -> Result<()>;

    async fn delete_item(&self, item_id: &str) -> Result<()>;

    async fn get_library(&self, library_id: &str) -> Result<RemoteLibrary>;

    /// Fetch items by id. Ids unknown to the server are omitted from the result.
    async fn get_items(&self, item_ids: &[String]) -> Result<Vec<RemoteItem>>;

    /// List a library page by page, optionally only items changed since `since`.
    async fn list_library_items(
        &self,
        library_id: &str,
        since: Option<&str>,
        start: usize,
        limit: usize,
    ) -> Result<ItemPage>;
}
