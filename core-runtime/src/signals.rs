//! Resettable boolean signals shared between components.
//!
//! Unlike a cancellation token a [`Flag`] can be cleared again (the
//! should-stop signal is raised on host sleep and lowered on wake). Holders
//! of a [`FlagReader`] can observe the flag but not change it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct FlagInner {
    set: AtomicBool,
    changed: Notify,
}

/// A named boolean signal with write access.
#[derive(Clone, Default)]
pub struct Flag {
    inner: Arc<FlagInner>,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.set.store(false, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Read-only view of this flag.
    pub fn reader(&self) -> FlagReader {
        FlagReader {
            inner: self.inner.clone(),
        }
    }
}

/// Read-only view of a [`Flag`].
#[derive(Clone)]
pub struct FlagReader {
    inner: Arc<FlagInner>,
}

impl FlagReader {
    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set.
    pub async fn wait_set(&self) {
        loop {
            let changed = self.inner.changed.notified();
            if self.is_set() {
                return;
            }
            changed.await;
        }
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Flag").field(&self.is_set()).finish()
    }
}

impl std::fmt::Debug for FlagReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FlagReader").field(&self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_and_clear() {
        let flag = Flag::new();
        let reader = flag.reader();
        assert!(!reader.is_set());

        flag.set();
        assert!(reader.is_set());

        flag.clear();
        assert!(!flag.is_set());
    }

    #[tokio::test]
    async fn test_wait_set_wakes_on_set() {
        let flag = Flag::new();
        let reader = flag.reader();

        let waiter = tokio::spawn(async move { reader.wait_set().await });
        tokio::task::yield_now().await;
        flag.set();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
