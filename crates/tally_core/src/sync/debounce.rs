//! Debounce window bookkeeping.
//!
//! Lazy changes are not flushed as they happen; each backend keeps one
//! [`Debounce`] that turns a stream of touches into a single deadline. The
//! deadline slides forward `delay` past the latest touch but never past
//! `max_wait` after the first touch of the window, so a busy typist still
//! gets saved.
//!
//! This struct only does the arithmetic. The scheduler worker owns the timer
//! and sleeps until [`Debounce::deadline`].

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    deadline: Instant,
}

/// Deadline tracker for one backend's lazy flushes.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    max_wait: Duration,
    window: Option<Window>,
}

impl Debounce {
    /// Track deadlines for a backend with the given quiet period and cap.
    pub fn new(delay: Duration, max_wait: Duration) -> Self {
        Debounce {
            delay,
            max_wait,
            window: None,
        }
    }

    /// Record a lazy change at `now`, opening a window or sliding the
    /// current one.
    pub fn touch(&mut self, now: Instant) {
        match &mut self.window {
            None => {
                let started = now;
                let deadline = (now + self.delay).min(started + self.max_wait);
                self.window = Some(Window { started, deadline });
            }
            Some(window) => {
                window.deadline = (now + self.delay).min(window.started + self.max_wait);
            }
        }
    }

    /// Deadline of the open window, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.window.map(|w| w.deadline)
    }

    /// Whether a window is armed.
    pub fn is_armed(&self) -> bool {
        self.window.is_some()
    }

    /// Close the window. Called when the pending changes flush, whatever
    /// triggered the flush.
    pub fn reset(&mut self) {
        self.window = None;
    }
}
