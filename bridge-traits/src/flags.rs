//! Shared Flag Storage
//!
//! A key-value store of boolean flags that every process instance of the host
//! application can observe. Only single-key atomicity is required; there are no
//! cross-key transactions.

use async_trait::async_trait;

use crate::error::Result;

/// Cross-instance flag store.
///
/// Implementations may be durable (an embedded database shared by all
/// instances) or in-memory when every participant lives in one process.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::flags::SharedFlagStore;
///
/// async fn claim(store: &dyn SharedFlagStore) -> Result<bool> {
///     store.try_set_flag("lock.catalog.held").await
/// }
/// ```
#[async_trait]
pub trait SharedFlagStore: Send + Sync {
    /// Read a flag. Unknown keys read as `false`.
    async fn get_flag(&self, key: &str) -> Result<bool>;

    /// Unconditionally write a flag.
    async fn set_flag(&self, key: &str, value: bool) -> Result<()>;

    /// Atomically set a flag if it is currently clear.
    ///
    /// Returns `true` when this call flipped the flag from clear to set and
    /// `false` when it was already set by someone else.
    async fn try_set_flag(&self, key: &str) -> Result<bool>;

    /// Clear a flag. Clearing an unknown key is not an error.
    async fn clear_flag(&self, key: &str) -> Result<()> {
        self.set_flag(key, false).await
    }

    /// List the keys of every set flag starting with `prefix`.
    async fn list_set_flags(&self, prefix: &str) -> Result<Vec<String>>;
}
