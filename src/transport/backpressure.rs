//! Inbound flow control for the client connector.
//!
//! The reader counts every frame it hands to the dispatch worker; the worker
//! counts every frame whose callbacks have finished. Once the difference (the
//! backlog) exceeds `high_threshold` the reader stops issuing reads, and it only
//! resumes after the backlog has fallen to `high_threshold / 2`. The gap between
//! the two thresholds keeps the reader from flapping on every frame.
//!
//! ```text
//! backlog:   ... 99 100 101 | 100 ... 60 ... 51 | 50
//! reading:   yes            | suspended          | resumed (once)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

/// Result of a backlog change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Suspended,
    Resumed,
}

/// Point-in-time view of a [`BackpressureController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureSnapshot {
    pub backlog: usize,
    pub suspended: bool,
    pub high_threshold: usize,
    pub low_threshold: usize,
    pub suspensions: u64,
}

#[derive(Debug, Default)]
struct State {
    backlog: usize,
    suspended: bool,
}

/// Backlog counter with hysteresis and a wake-up for the suspended reader.
#[derive(Debug)]
pub struct BackpressureController {
    high: usize,
    low: usize,
    state: Mutex<State>,
    resumed: Notify,
    suspensions: AtomicU64,
}

impl BackpressureController {
    pub fn new(high_threshold: usize) -> Self {
        Self {
            high: high_threshold,
            low: high_threshold / 2,
            state: Mutex::new(State::default()),
            resumed: Notify::new(),
            suspensions: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[inline]
    pub fn high_threshold(&self) -> usize {
        self.high
    }

    #[inline]
    pub fn low_threshold(&self) -> usize {
        self.low
    }

    pub fn backlog(&self) -> usize {
        self.state().backlog
    }

    pub fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    /// A frame was handed to the dispatcher.
    pub fn on_enqueued(&self) -> Transition {
        let mut state = self.state();
        state.backlog += 1;
        if !state.suspended && state.backlog > self.high {
            state.suspended = true;
            self.suspensions.fetch_add(1, Ordering::Relaxed);
            debug!(backlog = state.backlog, high = self.high, "Suspending reads");
            return Transition::Suspended;
        }
        Transition::Unchanged
    }

    /// The callbacks for one frame finished, successfully or not.
    pub fn on_completed(&self) -> Transition {
        let mut state = self.state();
        state.backlog = state.backlog.saturating_sub(1);
        if state.suspended && state.backlog <= self.low {
            state.suspended = false;
            drop(state);
            debug!(low = self.low, "Resuming reads");
            self.resumed.notify_one();
            return Transition::Resumed;
        }
        Transition::Unchanged
    }

    /// Wait until reads may be issued again. Returns immediately when not
    /// suspended.
    pub async fn wait_resumed(&self) {
        loop {
            let notified = self.resumed.notified();
            if !self.is_suspended() {
                return;
            }
            notified.await;
        }
    }

    /// Forget the backlog of a connection that went away.
    pub fn reset(&self) {
        let mut state = self.state();
        let was_suspended = state.suspended;
        *state = State::default();
        drop(state);
        if was_suspended {
            self.resumed.notify_one();
        }
    }

    pub fn snapshot(&self) -> BackpressureSnapshot {
        let state = self.state();
        BackpressureSnapshot {
            backlog: state.backlog,
            suspended: state.suspended,
            high_threshold: self.high,
            low_threshold: self.low,
            suspensions: self.suspensions.load(Ordering::Relaxed),
        }
    }
}
