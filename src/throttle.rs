//! Leading-edge throttle with trailing coalescing.
//!
//! [`Throttle`] is a plain state object: it owns the window, the instant of
//! the last run, and the pending arguments, and leaves the single timer to
//! its owner (typically a `sleep_until(deadline)` arm in a `select!` loop).
//! Construction starts the first window, so a burst that begins immediately
//! after creation coalesces into one trailing run; once a full window has
//! elapsed since the last run, the next offer executes on the leading edge.
//!
//! All instants are `tokio::time::Instant` so tests under a paused clock
//! control the window.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last_run: Instant,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self::new_at(window, Instant::now())
    }

    /// Construct with an explicit window start.
    pub fn new_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            last_run: now,
            pending: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Offer work to the throttle. Returns `Some(args)` when the caller
    /// should run immediately (leading edge); otherwise the args are held
    /// for the trailing edge, replacing any previously pending args.
    pub fn offer(&mut self, args: T, now: Instant) -> Option<T> {
        if self.pending.is_none() && now.duration_since(self.last_run) >= self.window {
            self.last_run = now;
            return Some(args);
        }
        self.pending = Some(args);
        None
    }

    /// Instant at which pending work becomes due, if any is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|_| self.last_run + self.window)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending args if their trailing deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.last_run = now;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Take the pending args immediately, regardless of the window.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        let taken = self.pending.take();
        if taken.is_some() {
            self.last_run = now;
        }
        taken
    }

    /// Drop pending work without running it.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Record an out-of-band run (e.g. an explicit flush by the owner) so
    /// the next offer respects the window.
    pub fn mark_ran(&mut self, now: Instant) {
        self.pending = None;
        self.last_run = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn test_burst_after_creation_coalesces() {
        let start = Instant::now();
        let mut throttle: Throttle<usize> = Throttle::new_at(WINDOW, start);

        assert_eq!(throttle.offer(1, at(start, 0)), None);
        assert_eq!(throttle.offer(2, at(start, 500)), None);
        assert!(throttle.has_pending());
        assert_eq!(throttle.deadline(), Some(at(start, 2000)));

        // Not due before the window closes.
        assert_eq!(throttle.take_due(at(start, 1999)), None);
        // Due at the trailing edge, with the latest args.
        assert_eq!(throttle.take_due(at(start, 2000)), Some(2));
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_leading_edge_after_idle_window() {
        let start = Instant::now();
        let mut throttle: Throttle<usize> = Throttle::new_at(WINDOW, start);

        assert_eq!(throttle.offer(1, at(start, 0)), None);
        assert_eq!(throttle.take_due(at(start, 2000)), Some(1));

        // A full window later the next offer runs immediately.
        assert_eq!(throttle.offer(2, at(start, 4000)), Some(2));
        assert!(!throttle.has_pending());

        // And a follow-up inside the fresh window coalesces again.
        assert_eq!(throttle.offer(3, at(start, 4100)), None);
        assert_eq!(throttle.deadline(), Some(at(start, 6000)));
    }

    #[test]
    fn test_flush_takes_pending_early() {
        let start = Instant::now();
        let mut throttle: Throttle<&str> = Throttle::new_at(WINDOW, start);

        assert_eq!(throttle.offer("a", at(start, 100)), None);
        assert_eq!(throttle.flush(at(start, 200)), Some("a"));
        assert_eq!(throttle.flush(at(start, 300)), None);

        // The flush counted as a run: the next offer is inside its window.
        assert_eq!(throttle.offer("b", at(start, 300)), None);
    }

    #[test]
    fn test_cancel_and_mark_ran() {
        let start = Instant::now();
        let mut throttle: Throttle<u8> = Throttle::new_at(WINDOW, start);

        assert_eq!(throttle.offer(1, at(start, 100)), None);
        throttle.cancel();
        assert!(!throttle.has_pending());
        assert_eq!(throttle.deadline(), None);

        throttle.mark_ran(at(start, 2500));
        // Window restarts at the marked run.
        assert_eq!(throttle.offer(2, at(start, 2600)), None);
        assert_eq!(throttle.deadline(), Some(at(start, 4500)));
    }

    #[test]
    fn test_late_poll_still_coalesces_latest_args() {
        let start = Instant::now();
        let mut throttle: Throttle<usize> = Throttle::new_at(WINDOW, start);

        assert_eq!(throttle.offer(1, at(start, 0)), None);
        // Owner polls late; a newer offer arrived after the deadline passed.
        assert_eq!(throttle.offer(2, at(start, 2500)), None);
        assert_eq!(throttle.take_due(at(start, 2500)), Some(2));
    }
}
