//! Start watchdog shared between a launcher and its supervisor thread.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Starting,
    /// The OS handed back a live process.
    Started,
    /// The process could not be created.
    Failed,
    /// Neither happened within the start bound.
    TimedOut,
}

#[derive(Debug)]
struct Progress {
    state: LaunchState,
    failure: Option<String>,
    pid: Option<u32>,
}

/// Leaves STARTING exactly once, through whichever of
/// [`started`](Self::started), [`fail`](Self::fail) or the timeout in
/// [`wait_for_started`](Self::wait_for_started) gets there first.
#[derive(Debug)]
pub struct LaunchWatchdog {
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl Default for LaunchWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchWatchdog {
    pub fn new() -> Self {
        Self {
            progress: Mutex::new(Progress {
                state: LaunchState::Starting,
                failure: None,
                pid: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Record a live process. Returns false if the launch already settled.
    pub fn started(&self, pid: u32) -> bool {
        self.settle(LaunchState::Started, |progress| progress.pid = Some(pid))
    }

    /// Record that the process could not be created. Returns false if the
    /// launch already settled.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        self.settle(LaunchState::Failed, |progress| {
            progress.failure = Some(cause);
        })
    }

    /// Block until the launch settles or `timeout` elapses. A timeout
    /// settles it as TIMED_OUT, so a late start is ignored.
    pub fn wait_for_started(&self, timeout: Duration) -> LaunchState {
        let guard = self.lock();
        let (mut progress, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |progress| {
                progress.state == LaunchState::Starting
            })
            .unwrap_or_else(PoisonError::into_inner);

        if progress.state == LaunchState::Starting {
            progress.state = LaunchState::TimedOut;
        }
        progress.state
    }

    pub fn state(&self) -> LaunchState {
        self.lock().state
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    fn settle(&self, state: LaunchState, record: impl FnOnce(&mut Progress)) -> bool {
        let mut progress = self.lock();
        if progress.state != LaunchState::Starting {
            return false;
        }
        progress.state = state;
        record(&mut progress);
        drop(progress);
        self.changed.notify_all();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
