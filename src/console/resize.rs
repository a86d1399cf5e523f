//! Coalescing of window resize signals.

use std::time::{Duration, Instant};

/// How long the window has to stay put before its size is sent.
pub const RESIZE_SETTLE: Duration = Duration::from_millis(500);

/// Tracks the most recent resize signal and says when it has settled.
#[derive(Debug)]
pub struct ResizeDebouncer {
    settle: Duration,
    last_signal: Option<Instant>,
}

impl Default for ResizeDebouncer {
    fn default() -> Self {
        Self::new(RESIZE_SETTLE)
    }
}

impl ResizeDebouncer {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            last_signal: None,
        }
    }

    /// Record a resize signal at `now`, restarting the settle period.
    pub fn touch(&mut self, now: Instant) {
        self.last_signal = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.last_signal.is_some()
    }

    /// True once, when the last signal is at least the settle period old.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.last_signal {
            Some(at) if now.saturating_duration_since(at) >= self.settle => {
                self.last_signal = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_due_without_a_signal() {
        let mut debouncer = ResizeDebouncer::default();
        assert!(!debouncer.take_due(Instant::now()));
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn burst_of_signals_yields_one_update() {
        let mut debouncer = ResizeDebouncer::new(Duration::from_millis(500));
        let start = Instant::now();

        for step in 0..5 {
            let at = start + Duration::from_millis(step * 100);
            debouncer.touch(at);
            assert!(!debouncer.take_due(at + Duration::from_millis(50)));
        }

        let last = start + Duration::from_millis(400);
        assert!(!debouncer.take_due(last + Duration::from_millis(499)));
        assert!(debouncer.take_due(last + Duration::from_millis(500)));
        assert!(!debouncer.take_due(last + Duration::from_millis(900)));
    }

    #[test]
    fn zero_settle_is_immediate() {
        let mut debouncer = ResizeDebouncer::new(Duration::ZERO);
        let now = Instant::now();
        debouncer.touch(now);
        assert!(debouncer.take_due(now));
    }
}
