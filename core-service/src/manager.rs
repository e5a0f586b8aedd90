//! Service lifetime across restarts.
//!
//! The host talks to a [`ServiceHandle`]: it forwards notifications and may
//! abort the service. [`ServiceManager::run`] drives [`ServiceLoop`] runs until
//! one of them exits for good.

use core_runtime::config::ServiceConfig;
use core_runtime::events::EventBus;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{ExitReason, Result, Termination};
use crate::router::Notification;
use crate::service_loop::ServiceLoop;

/// Host-facing handle. Clone freely.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    notifications: mpsc::UnboundedSender<Notification>,
    abort: CancellationToken,
}

impl ServiceHandle {
    /// Forward a notification; returns `false` once the service has exited.
    pub fn submit(&self, notification: Notification) -> bool {
        self.notifications.send(notification).is_ok()
    }

    /// Forward a plugin notification.
    pub fn notify(&self, method: &str, payload: &str) -> bool {
        self.submit(Notification::plugin(method, payload))
    }

    /// Stop the service without waiting for the next tick.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

pub struct ServiceManager {
    config: ServiceConfig,
    events: EventBus,
    abort: CancellationToken,
    sender: mpsc::UnboundedSender<Notification>,
    inbox: mpsc::UnboundedReceiver<Notification>,
}

impl ServiceManager {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_events(config, EventBus::default())
    }

    /// Use an existing bus, so the host can subscribe before the first run.
    pub fn with_events(config: ServiceConfig, events: EventBus) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            events,
            abort: CancellationToken::new(),
            sender,
            inbox,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            notifications: self.sender.clone(),
            abort: self.abort.clone(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run until a service run exits. Restarts rebuild every component;
    /// notifications queued in between are delivered to the next run.
    #[instrument(skip_all, fields(device_id = %self.config.device_id))]
    pub async fn run(mut self) -> Result<ExitReason> {
        let mut restarts = 0u32;
        loop {
            if self.abort.is_cancelled() {
                return Ok(ExitReason::Aborted);
            }

            let service = ServiceLoop::new(self.config.clone(), self.events.clone(), &self.abort);
            match service.run(&mut self.inbox).await {
                Ok(Termination::Exit(reason)) => {
                    info!(%reason, restarts, "Service exited");
                    return Ok(reason);
                }
                Ok(Termination::Restart(reason)) => {
                    restarts += 1;
                    info!(%reason, restarts, "Restarting service");
                }
                Err(e) => {
                    warn!(error = %e, "Service failed to run");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_reports_closed_inbox() {
        let (sender, inbox) = mpsc::unbounded_channel();
        let handle = ServiceHandle {
            notifications: sender,
            abort: CancellationToken::new(),
        };
        assert!(handle.notify("LibraryChanged", "[{}]"));

        drop(inbox);
        assert!(!handle.notify("LibraryChanged", "[{}]"));

        handle.abort();
        assert!(handle.is_aborted());
    }
}
