//! Resize and suspend signals for the console.
//!
//! Handlers only flip atomic flags. The proxy loop collects them on its next
//! iteration, so no I/O ever happens in signal context.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::signal::{SIGTSTP, SIGWINCH};
use signal_hook::SigId;

use super::ConsoleEvents;

/// Flags set by SIGWINCH and SIGTSTP.
pub struct SignalFlags {
    resized: Arc<AtomicBool>,
    suspended: Arc<AtomicBool>,
    ids: Vec<SigId>,
}

impl SignalFlags {
    /// Install the handlers. Registering SIGTSTP replaces the default stop
    /// action, so the console decides what a suspend means.
    pub fn register() -> io::Result<Self> {
        let resized = Arc::new(AtomicBool::new(false));
        let suspended = Arc::new(AtomicBool::new(false));

        let ids = vec![
            signal_hook::flag::register(SIGWINCH, Arc::clone(&resized))?,
            signal_hook::flag::register(SIGTSTP, Arc::clone(&suspended))?,
        ];

        Ok(Self {
            resized,
            suspended,
            ids,
        })
    }

    /// Read and clear both flags.
    pub fn take(&self) -> ConsoleEvents {
        ConsoleEvents {
            resized: self.resized.swap(false, Ordering::SeqCst),
            suspended: self.suspended.swap(false, Ordering::SeqCst),
        }
    }
}

impl Drop for SignalFlags {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_resize_is_reported_once() {
        let flags = SignalFlags::register().unwrap();
        signal_hook::low_level::raise(SIGWINCH).unwrap();

        let events = flags.take();
        assert!(events.resized);
        assert!(!events.suspended);
        assert_eq!(flags.take(), ConsoleEvents::default());
    }
}
