//! # Cross-Instance Process Lock
//!
//! Mutual exclusion between independent process instances of the host
//! application, which share no native mutex. The only source of truth is a
//! boolean flag in a [`SharedFlagStore`] keyed by resource name; every
//! participant claims it with an atomic test-and-set and polls while it is
//! held by someone else.
//!
//! Polling starts at [`LockConfig::initial_delay`] and doubles up to
//! [`LockConfig::max_delay`].
//!
//! A holder that dies without releasing leaves the flag set. Dropping a held
//! handle inside a runtime schedules a release; a crashed process relies on
//! [`ProcessLock::force_clear`] when the service starts again.
//!
//! ```ignore
//! let mut lock = ProcessLock::new(flags, "catalog").with_abort(abort.clone());
//! if lock.acquire(true, Some(Duration::from_secs(30))).await? {
//!     // write to the catalog
//!     lock.release().await?;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::SharedFlagStore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::error::{Result, StoreError};

/// Polling policy for blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_micros(500),
            max_delay: Duration::from_millis(15),
        }
    }
}

impl LockConfig {
    /// Delay to use after `current`, capped at `max_delay`.
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Handle on one named lock.
///
/// The handle tracks whether *it* holds the lock; the shared flag tracks
/// whether *anyone* does.
pub struct ProcessLock {
    store: Arc<dyn SharedFlagStore>,
    resource: String,
    config: LockConfig,
    abort: Option<CancellationToken>,
    held: bool,
}

impl ProcessLock {
    pub fn new(store: Arc<dyn SharedFlagStore>, resource: impl Into<String>) -> Self {
        Self {
            store,
            resource: resource.into(),
            config: LockConfig::default(),
            abort: None,
            held: false,
        }
    }

    pub fn with_config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop polling (and report "not acquired") once `abort` fires.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether this handle currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn flag_key(resource: &str) -> String {
        format!("lock.{}.held", resource)
    }

    /// Try to take the lock.
    ///
    /// - `blocking = false`: a single attempt; `timeout` must be `None`.
    /// - `blocking = true, timeout = Some(t)`: poll until acquired or `t`
    ///   elapses, then return `Ok(false)`.
    /// - `blocking = true, timeout = None`: poll until acquired or aborted.
    #[instrument(skip(self), fields(resource = %self.resource))]
    pub async fn acquire(&mut self, blocking: bool, timeout: Option<Duration>) -> Result<bool> {
        if !blocking && timeout.is_some() {
            return Err(StoreError::InvalidArgument(
                "a timeout cannot be combined with a non-blocking acquire".to_string(),
            ));
        }

        if self.held {
            return Err(StoreError::IllegalState(format!(
                "lock '{}' is already held by this handle",
                self.resource
            )));
        }

        let key = Self::flag_key(&self.resource);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut delay = self.config.initial_delay;

        loop {
            if self.store.try_set_flag(&key).await? {
                self.held = true;
                debug!("Lock acquired");
                return Ok(true);
            }

            if !blocking {
                return Ok(false);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(?timeout, "Lock wait timed out");
                        return Ok(false);
                    }
                    delay.min(deadline - now)
                }
                None => delay,
            };

            match &self.abort {
                Some(abort) => {
                    tokio::select! {
                        _ = abort.cancelled() => {
                            debug!("Lock wait aborted");
                            return Ok(false);
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }

            delay = self.config.next_delay(delay);
        }
    }

    /// Release the lock held by this handle.
    ///
    /// Releasing a lock this handle does not hold is a protocol violation and
    /// fails with `IllegalState`.
    #[instrument(skip(self), fields(resource = %self.resource))]
    pub async fn release(&mut self) -> Result<()> {
        if !self.held {
            error!("Release called on a lock this handle does not hold");
            return Err(StoreError::IllegalState(format!(
                "release of unheld lock '{}'",
                self.resource
            )));
        }

        self.store.clear_flag(&Self::flag_key(&self.resource)).await?;
        self.held = false;
        debug!("Lock released");
        Ok(())
    }

    /// Whether any participant holds the lock.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.store.get_flag(&Self::flag_key(&self.resource)).await?)
    }

    /// Acquire with a bounded wait, run `work`, and release on every path.
    ///
    /// Fails with `LockTimeout` when the lock cannot be taken within `wait`.
    pub async fn run_locked<T, E, F>(&mut self, wait: Duration, work: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<StoreError>,
    {
        if !self.acquire(true, Some(wait)).await? {
            return Err(StoreError::LockTimeout {
                resource: self.resource.clone(),
            }
            .into());
        }

        let outcome = work.await;
        let released = self.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    }

    /// Clear a lock flag regardless of holder.
    ///
    /// Only for recovering from a crashed holder. Returns whether the flag
    /// was set.
    pub async fn force_clear(store: &dyn SharedFlagStore, resource: &str) -> Result<bool> {
        let key = Self::flag_key(resource);
        let was_set = store.get_flag(&key).await?;
        store.clear_flag(&key).await?;

        if was_set {
            warn!(resource, "Force-cleared a stale lock");
        }
        Ok(was_set)
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = Self::flag_key(&self.resource);
        let resource = self.resource.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(resource = %resource, "Lock handle dropped while held, releasing");
                handle.spawn(async move {
                    if let Err(e) = store.clear_flag(&key).await {
                        error!(resource = %resource, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                error!(resource = %resource, "Lock handle dropped outside a runtime; flag left set");
            }
        }
    }
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock")
            .field("resource", &self.resource)
            .field("held", &self.held)
            .field("config", &self.config)
            .finish()
    }
}
