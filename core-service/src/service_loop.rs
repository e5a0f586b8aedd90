//! # Service Loop
//!
//! One run of the background service: build a fresh component set, poll at a
//! fixed cadence until something ends the run, then tear everything down.
//!
//! ## Phases
//!
//! - **Starting** - clear stale locks, gate on the catalog schema version,
//!   build the supervisor, orchestrator and router, register the default
//!   server
//! - **Running** - route notifications, follow connection state, tick once
//!   per poll interval
//! - **Restarting** / **ShuttingDown** - stop sync, close connections, stop
//!   router lanes
//!
//! Each tick checks for a profile switch, a requested restart and, while
//! signed in, push channel liveness, playback progress timers and the
//! deferred-verify and retry passes.

use std::sync::Arc;
use std::time::Duration;

use core_auth::{ConnectionState, ConnectionSupervisor};
use core_library::{
    initialize_catalog, reset_catalog, verify_catalog, DataStore, LockConfig, ProcessLock,
    SessionMode, StoreError, StoreLocator, CATALOG,
};
use core_runtime::config::ServiceConfig;
use core_runtime::events::{
    ConnectionEvent, CoreEvent, EventBus, EventStream, PlaybackEvent, ServiceEvent, ServicePhase,
};
use core_sync::{CheckpointFile, SyncConfig, SyncDeps, SyncOrchestrator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use bridge_traits::NotificationLevel;

use crate::context::ServiceContext;
use crate::error::{ExitReason, RestartReason, Result, Termination};
use crate::handlers::ServiceHandlers;
use crate::router::{Notification, NotificationRouter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    pub progress_update_interval: Duration,
    pub progress_report_interval: Duration,
    pub startup_delay: Duration,
    pub reset_drain_wait: Duration,
    pub catalog_lock_wait: Duration,
    pub minimum_schema_version: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            progress_update_interval: Duration::from_secs(4),
            progress_report_interval: Duration::from_secs(40),
            startup_delay: Duration::ZERO,
            reset_drain_wait: Duration::from_secs(10),
            catalog_lock_wait: Duration::from_secs(30),
            minimum_schema_version: core_library::CATALOG_SCHEMA_VERSION.to_string(),
        }
    }
}

impl From<&ServiceConfig> for LoopConfig {
    fn from(config: &ServiceConfig) -> Self {
        let t = &config.timings;
        Self {
            poll_interval: t.poll_interval,
            progress_update_interval: t.progress_update_interval,
            progress_report_interval: t.progress_report_interval,
            startup_delay: t.startup_delay,
            reset_drain_wait: t.reset_drain_wait,
            catalog_lock_wait: t.catalog_lock_wait,
            minimum_schema_version: config.minimum_schema_version.clone(),
        }
    }
}

/// The two playback timers: frequent position updates and the infrequent
/// full progress report.
#[derive(Debug)]
struct ProgressTimers {
    update_interval: Duration,
    report_interval: Duration,
    last_update: Instant,
    last_report: Instant,
}

impl ProgressTimers {
    fn new(update_interval: Duration, report_interval: Duration, now: Instant) -> Self {
        Self {
            update_interval,
            report_interval,
            last_update: now,
            last_report: now,
        }
    }

    /// `Some(report)` when a position update is due.
    fn poll(&mut self, now: Instant) -> Option<bool> {
        if now.duration_since(self.last_update) < self.update_interval {
            return None;
        }
        self.last_update = now;

        let report = now.duration_since(self.last_report) >= self.report_interval;
        if report {
            self.last_report = now;
        }
        Some(report)
    }
}

struct Components {
    profile: String,
    context: ServiceContext,
    supervisor: ConnectionSupervisor,
    sync: Arc<SyncOrchestrator>,
    router: NotificationRouter,
}

enum Startup {
    Ready(Components),
    Done(Termination),
}

/// Tasks spawned during a run.
#[derive(Default)]
struct Background {
    maintenance: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Background {
    fn spawn(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }

    fn maintenance_idle(&self) -> bool {
        self.maintenance
            .as_ref()
            .map_or(true, |task| task.is_finished())
    }

    fn abort_all(self) {
        for task in self.maintenance.into_iter().chain(self.tasks) {
            task.abort();
        }
    }
}

pub struct ServiceLoop {
    config: ServiceConfig,
    settings: LoopConfig,
    events: EventBus,
    abort: CancellationToken,
}

impl ServiceLoop {
    /// `abort` is the service-wide token; each run works under a child.
    pub fn new(config: ServiceConfig, events: EventBus, abort: &CancellationToken) -> Self {
        Self {
            settings: LoopConfig::from(&config),
            config,
            events,
            abort: abort.clone(),
        }
    }

    /// Run once. Notifications are read from `inbox`, which outlives the run.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        inbox: &mut mpsc::UnboundedReceiver<Notification>,
    ) -> Result<Termination> {
        self.phase(ServicePhase::Starting);
        let run_token = self.abort.child_token();

        let components = match self.start(&run_token).await {
            Ok(Startup::Ready(components)) => components,
            Ok(Startup::Done(termination)) => {
                run_token.cancel();
                return Ok(termination);
            }
            Err(e) => {
                run_token.cancel();
                return Err(e);
            }
        };

        self.phase(ServicePhase::Running);
        let mut background = Background::default();
        let termination = self.poll(&components, inbox, &mut background).await;
        info!(%termination, "Service run ending");

        self.phase(match termination {
            Termination::Restart(_) => ServicePhase::Restarting,
            Termination::Exit(_) => ServicePhase::ShuttingDown,
        });
        self.tear_down(components, background, run_token).await;
        Ok(termination)
    }

    async fn start(&self, run_token: &CancellationToken) -> Result<Startup> {
        let profile = self.config.host.current_profile().await?;
        info!(profile = %profile, device_id = %self.config.device_id, "Starting service");

        initialize_catalog(&self.config.catalog_path).await?;
        let store = DataStore::new(Arc::new(StoreLocator::for_host(
            self.config.catalog_path.clone(),
            self.config.host_database_dir.clone(),
            self.config.host_log_path.clone(),
        )))
        .with_open_timeout(self.config.timings.store_open_timeout);

        let checkpoint = CheckpointFile::new(self.config.sync_checkpoint_path());
        self.clear_stale_locks(&checkpoint).await?;

        let context = ServiceContext::new(run_token.clone());
        let sync = Arc::new(SyncOrchestrator::new(
            SyncDeps {
                store: store.clone(),
                flags: self.config.flag_store.clone(),
                server: self.config.media_server.clone(),
                events: self.events.clone(),
                clock: self.config.clock.clone(),
            },
            checkpoint,
            SyncConfig::from(&self.config),
            context.sync_stop(),
            run_token.clone(),
        ));

        match verify_catalog(&store, &self.settings.minimum_schema_version).await {
            Ok(()) => {}
            Err(StoreError::SchemaTooOld { found, minimum }) => {
                let termination = self
                    .confirm_reset(&store, &context, &sync, found, minimum)
                    .await?;
                return Ok(Startup::Done(termination));
            }
            Err(e) => return Err(e.into()),
        }

        let supervisor =
            ConnectionSupervisor::from_config(&self.config, self.events.clone(), run_token);
        let handlers = ServiceHandlers::new(
            supervisor.clone(),
            sync.clone(),
            self.config.media_server.clone(),
            self.config.host.clone(),
            self.config.device_id.clone(),
            context.handler_signals(),
        );
        let router = NotificationRouter::new(handlers.into_table(), run_token);

        Ok(Startup::Ready(Components {
            profile,
            context,
            supervisor,
            sync,
            router,
        }))
    }

    /// A crashed holder never clears its flag; no lock can be legitimately
    /// held before this instance has started.
    async fn clear_stale_locks(&self, checkpoint: &CheckpointFile) -> Result<()> {
        let flags = self.config.flag_store.as_ref();
        ProcessLock::force_clear(flags, CATALOG).await?;

        let saved = checkpoint.load().await;
        for library_id in saved.whitelist.iter().chain(&saved.libraries) {
            ProcessLock::force_clear(flags, &format!("sync.{}", library_id)).await?;
        }
        Ok(())
    }

    /// The catalog predates the minimum schema. Only an explicit confirmation
    /// resets it; declining fails startup.
    async fn confirm_reset(
        &self,
        store: &DataStore,
        context: &ServiceContext,
        sync: &SyncOrchestrator,
        found: String,
        minimum: String,
    ) -> Result<Termination> {
        warn!(found = %found, minimum = %minimum, "Catalog schema is out of date");
        let message = format!(
            "The local catalog (version {}) is older than {} and must be rebuilt. Reset it now?",
            found, minimum
        );
        if !self.config.host.confirm("Catalog reset", &message).await {
            warn!("Catalog reset declined");
            if let Err(e) = self
                .config
                .host
                .notify(
                    "Catalog reset",
                    "The service cannot start with an out of date catalog",
                    NotificationLevel::Warning,
                )
                .await
            {
                debug!(error = %e, "Could not show notification");
            }
            return Err(StoreError::SchemaTooOld { found, minimum }.into());
        }

        context.loop_signals().request_stop();
        if !sync.drain(self.settings.reset_drain_wait).await {
            warn!("Library sync still running, resetting anyway");
        }

        let mut lock = ProcessLock::new(self.config.flag_store.clone(), CATALOG)
            .with_config(LockConfig {
                initial_delay: self.config.timings.lock_initial_delay,
                max_delay: self.config.timings.lock_max_delay,
            })
            .with_abort(context.abort().clone());
        lock.run_locked::<_, StoreError, _>(
            self.settings.catalog_lock_wait,
            store.with_session(CATALOG, SessionMode::Commit, |session| {
                Box::pin(async move { reset_catalog(session.conn()?).await })
            }),
        )
        .await?;

        CheckpointFile::new(self.config.sync_checkpoint_path())
            .delete()
            .await?;
        info!("Catalog reset complete");
        Ok(Termination::Restart(RestartReason::CatalogReset))
    }

    async fn poll(
        &self,
        components: &Components,
        inbox: &mut mpsc::UnboundedReceiver<Notification>,
        background: &mut Background,
    ) -> Termination {
        let mut events = EventStream::new(self.events.subscribe())
            .filter(|event| matches!(event, CoreEvent::Connection(_)));
        let signals = components.context.loop_signals();
        let abort = components.context.abort().clone();

        if !self.settings.startup_delay.is_zero() {
            tokio::select! {
                _ = abort.cancelled() => return Termination::Exit(ExitReason::Aborted),
                _ = tokio::time::sleep(self.settings.startup_delay) => {}
            }
        }
        components.supervisor.register(None).await;

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress = ProgressTimers::new(
            self.settings.progress_update_interval,
            self.settings.progress_report_interval,
            Instant::now(),
        );
        let mut inbox_open = true;

        loop {
            tokio::select! {
                _ = abort.cancelled() => return Termination::Exit(ExitReason::Aborted),
                _ = signals.quit().wait_set() => return Termination::Exit(ExitReason::Quit),
                received = inbox.recv(), if inbox_open => match received {
                    Some(notification) => {
                        components.router.submit(notification);
                    }
                    None => {
                        debug!("Notification inbox closed");
                        inbox_open = false;
                    }
                },
                Ok(event) = events.recv() => {
                    self.follow(components, event, background).await;
                }
                _ = ticker.tick() => {
                    if let Some(termination) = self.tick(components, &mut progress, background).await {
                        return termination;
                    }
                }
            }
        }
    }

    /// Start library sync when the default server signs in, stop it when the
    /// connection is lost.
    async fn follow(&self, components: &Components, event: CoreEvent, background: &mut Background) {
        debug!(event = event.description(), "Following connection event");
        let CoreEvent::Connection(event) = event else {
            return;
        };
        match event {
            ConnectionEvent::SessionEstablished {
                server_id: None,
                user_id,
            } => {
                components.sync.start(&user_id).await;
                let sync = components.sync.clone();
                background.spawn(tokio::spawn(async move {
                    sync.resume_interrupted().await;
                }));
            }
            ConnectionEvent::StateChanged {
                server_id: None,
                from: ConnectionState::SignedIn,
                to,
            } if to != ConnectionState::SignedIn => {
                components.sync.stop().await;
            }
            _ => {}
        }
    }

    async fn tick(
        &self,
        components: &Components,
        progress: &mut ProgressTimers,
        background: &mut Background,
    ) -> Option<Termination> {
        match self.config.host.current_profile().await {
            Ok(profile) if profile != components.profile => {
                info!(from = %components.profile, to = %profile, "Profile switched");
                return Some(Termination::Exit(ExitReason::ProfileSwitched));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read the host profile"),
        }

        if components.supervisor.state(None).await != ConnectionState::SignedIn {
            return None;
        }

        if !self.config.push_channel.is_alive() {
            info!("Push channel disconnected");
            if let Err(e) = self
                .config
                .host
                .notify("Restarting", "Lost the server connection", NotificationLevel::Info)
                .await
            {
                debug!(error = %e, "Could not show notification");
            }
            return Some(Termination::Restart(RestartReason::PushChannelLost));
        }

        if self.config.playback_monitor.is_playing().await {
            if let Some(report) = progress.poll(Instant::now()) {
                let _ = self
                    .events
                    .emit(CoreEvent::Playback(PlaybackEvent::ProgressRequested { report }));
            }
        }

        if background.maintenance_idle() {
            let sync = components.sync.clone();
            background.maintenance = Some(tokio::spawn(async move {
                if let Err(e) = sync.process_verify_queue().await {
                    warn!(error = %e, "Deferred verification failed");
                }
                let retried = sync.retry_pending().await;
                if retried > 0 {
                    debug!(retried, "Retry pass finished");
                }
            }));
        }
        None
    }

    async fn tear_down(
        &self,
        components: Components,
        background: Background,
        run_token: CancellationToken,
    ) {
        components.context.loop_signals().request_stop();
        components.sync.stop().await;
        if !components.sync.drain(self.settings.reset_drain_wait).await {
            error!("Library sync did not finish in time");
        }

        run_token.cancel();
        components.supervisor.shutdown().await;
        components.router.shutdown().await;
        background.abort_all();
        debug!("Service components torn down");
    }

    fn phase(&self, phase: ServicePhase) {
        debug!(?phase, "Service phase");
        let _ = self
            .events
            .emit(CoreEvent::Service(ServiceEvent::PhaseChanged { phase }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_timers_space_updates_and_reports() {
        let start = Instant::now();
        let mut timers =
            ProgressTimers::new(Duration::from_secs(4), Duration::from_secs(40), start);

        assert_eq!(timers.poll(start + Duration::from_secs(1)), None);
        assert_eq!(timers.poll(start + Duration::from_secs(4)), Some(false));
        assert_eq!(timers.poll(start + Duration::from_secs(6)), None);

        let mut reports = 0;
        let mut updates = 0;
        for second in (8..=44).step_by(4) {
            match timers.poll(start + Duration::from_secs(second)) {
                Some(true) => reports += 1,
                Some(false) => updates += 1,
                None => {}
            }
        }
        // Report at 40s, plain updates at 8..36 and 44.
        assert_eq!(reports, 1);
        assert_eq!(updates, 9);
    }

    #[test]
    fn test_loop_config_follows_service_timings() {
        let defaults = LoopConfig::default();
        assert_eq!(defaults.poll_interval, Duration::from_secs(1));
        assert_eq!(defaults.progress_report_interval, Duration::from_secs(40));
        assert_eq!(defaults.minimum_schema_version, "3.1.0");
    }
}
