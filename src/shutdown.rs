//! Process-wide shutdown hook.
//!
//! SIGTERM, SIGHUP and SIGINT are picked up on a dedicated thread, which
//! runs a cleanup action once and raises a flag the console loop watches.
//! The cleanup must be safe to repeat, since the normal exit path may run
//! the same release afterwards.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::info;

pub struct ShutdownHook {
    triggered: Arc<AtomicBool>,
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl ShutdownHook {
    /// Install the hook. `cleanup` runs on the first termination signal.
    pub fn install<F>(cleanup: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let triggered = Arc::new(AtomicBool::new(false));
        let mut signals = Signals::new([SIGTERM, SIGHUP, SIGINT])?;
        let handle = signals.handle();

        let flag = Arc::clone(&triggered);
        let thread = thread::Builder::new()
            .name("shutdown-hook".to_string())
            .spawn(move || {
                let mut cleanup = Some(cleanup);
                for signal in signals.forever() {
                    info!(signal, "termination signal received");
                    flag.store(true, Ordering::SeqCst);
                    if let Some(cleanup) = cleanup.take() {
                        cleanup();
                    }
                }
            })?;

        Ok(Self {
            triggered,
            handle,
            thread: Some(thread),
        })
    }

    /// Shared flag, set once a termination signal arrived.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.triggered)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHook {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[test]
    fn hangup_runs_cleanup_once_and_sets_flag() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let hook = ShutdownHook::install(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        signal_hook::low_level::raise(SIGHUP).unwrap();
        signal_hook::low_level::raise(SIGHUP).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !hook.is_triggered() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(hook.is_triggered());
        drop(hook);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
