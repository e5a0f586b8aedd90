use std::fmt;

use serde::{Deserialize, Serialize};

pub use core_runtime::events::ConnectionState;

/// Identifies one supervised server connection.
///
/// Remote notifications carry an optional `ServerId`; a missing id designates
/// the default server from the credentials file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerSlot {
    Default,
    Named(String),
}

impl ServerSlot {
    pub fn from_id(server_id: Option<&str>) -> Self {
        match server_id {
            Some(id) => ServerSlot::Named(id.to_string()),
            None => ServerSlot::Default,
        }
    }

    /// The id as passed to the server connector.
    pub fn id(&self) -> Option<&str> {
        match self {
            ServerSlot::Default => None,
            ServerSlot::Named(id) => Some(id),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, ServerSlot::Default)
    }
}

impl fmt::Display for ServerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSlot::Default => write!(f, "default"),
            ServerSlot::Named(id) => write!(f, "{}", id),
        }
    }
}

impl From<Option<String>> for ServerSlot {
    fn from(server_id: Option<String>) -> Self {
        match server_id {
            Some(id) => ServerSlot::Named(id),
            None => ServerSlot::Default,
        }
    }
}
