//! Signals shared by the components of one service run.
//!
//! Each component receives only the handles it needs: the sync orchestrator
//! can observe should-stop, notification handlers can raise and lower it and
//! request a quit, and the service loop reads quit.

use core_runtime::{Flag, FlagReader};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct ServiceContext {
    should_stop: Flag,
    quit: Flag,
    abort: CancellationToken,
}

impl ServiceContext {
    /// `abort` cancels this run only; it is normally a child of the
    /// service-wide token.
    pub fn new(abort: CancellationToken) -> Self {
        Self {
            abort,
            ..Self::default()
        }
    }

    /// What library sync may observe.
    pub fn sync_stop(&self) -> FlagReader {
        self.should_stop.reader()
    }

    pub fn handler_signals(&self) -> HandlerSignals {
        HandlerSignals {
            should_stop: self.should_stop.clone(),
            quit: self.quit.clone(),
        }
    }

    pub fn loop_signals(&self) -> LoopSignals {
        LoopSignals {
            should_stop: self.should_stop.clone(),
            quit: self.quit.reader(),
        }
    }

    pub fn abort(&self) -> &CancellationToken {
        &self.abort
    }
}

/// Signals notification handlers may raise.
#[derive(Clone)]
pub struct HandlerSignals {
    should_stop: Flag,
    quit: Flag,
}

impl HandlerSignals {
    pub fn request_stop(&self) {
        self.should_stop.set();
    }

    pub fn clear_stop(&self) {
        self.should_stop.clear();
    }

    pub fn request_quit(&self) {
        self.should_stop.set();
        self.quit.set();
    }

    pub fn stop_requested(&self) -> bool {
        self.should_stop.is_set()
    }
}

/// Signals the service loop reacts to.
#[derive(Clone)]
pub struct LoopSignals {
    should_stop: Flag,
    quit: FlagReader,
}

impl LoopSignals {
    pub fn quit(&self) -> &FlagReader {
        &self.quit
    }

    /// Raised before a destructive reset and on shutdown.
    pub fn request_stop(&self) {
        self.should_stop.set();
    }
}
