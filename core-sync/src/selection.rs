//! Library selection actions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A change to the set of libraries opted into sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionAction {
    /// Full re-sync of selected libraries.
    Sync,
    /// Remove then add again. Not atomic: a crash between the two steps
    /// leaves the library removed.
    Repair,
    Add,
    Remove,
}

impl SelectionAction {
    /// Map a `*LibrarySelection` notification method to its action.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "SyncLibrarySelection" => Some(SelectionAction::Sync),
            "RepairLibrarySelection" => Some(SelectionAction::Repair),
            "AddLibrarySelection" => Some(SelectionAction::Add),
            "RemoveLibrarySelection" => Some(SelectionAction::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for SelectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionAction::Sync => write!(f, "sync"),
            SelectionAction::Repair => write!(f, "repair"),
            SelectionAction::Add => write!(f, "add"),
            SelectionAction::Remove => write!(f, "remove"),
        }
    }
}

impl FromStr for SelectionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(SelectionAction::Sync),
            "repair" => Ok(SelectionAction::Repair),
            "add" => Ok(SelectionAction::Add),
            "remove" => Ok(SelectionAction::Remove),
            _ => Err(format!("unknown selection action '{}'", s)),
        }
    }
}

/// Split a comma-separated `Id` payload field into library ids.
pub fn split_library_ids(ids: &str) -> Vec<String> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
