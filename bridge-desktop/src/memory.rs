//! In-process flag storage

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    flags::SharedFlagStore,
};

/// Flag store for participants that all live in one process.
#[derive(Debug, Default)]
pub struct InMemoryFlagStore {
    flags: Mutex<HashMap<String, bool>>,
}

impl InMemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_flags<T>(&self, f: impl FnOnce(&mut HashMap<String, bool>) -> T) -> Result<T> {
        let mut flags = self
            .flags
            .lock()
            .map_err(|_| BridgeError::OperationFailed("flag map poisoned".to_string()))?;
        Ok(f(&mut flags))
    }
}

#[async_trait]
impl SharedFlagStore for InMemoryFlagStore {
    async fn get_flag(&self, key: &str) -> Result<bool> {
        self.with_flags(|flags| flags.get(key).copied().unwrap_or(false))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.with_flags(|flags| {
            flags.insert(key.to_string(), value);
        })
    }

    async fn try_set_flag(&self, key: &str) -> Result<bool> {
        self.with_flags(|flags| {
            let slot = flags.entry(key.to_string()).or_insert(false);
            if *slot {
                false
            } else {
                *slot = true;
                true
            }
        })
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        self.with_flags(|flags| {
            flags.remove(key);
        })
    }

    async fn list_set_flags(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_flags(|flags| {
            let mut keys: Vec<String> = flags
                .iter()
                .filter(|(k, v)| **v && k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            keys
        })
    }
}
