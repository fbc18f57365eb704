//! Time source and cancellable waiting.
//!
//! Sessions never sleep directly; they ask a [`Clock`] to wait, and every wait ends
//! early once the session's [`CancellationToken`] fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Shared stop signal. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    // Dropping the sender disconnects every receiver, waking blocked waits.
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let mut sender = match self.inner.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout`, returning early on cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        if self.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        match self.inner.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => WaitOutcome::Elapsed,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => WaitOutcome::Cancelled,
        }
    }
}

pub trait Clock {
    /// Monotonic time for pacing decisions.
    fn now(&self) -> Instant;

    /// Wall time stamped on records.
    fn now_utc(&self) -> DateTime<Utc>;

    fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
        if duration.is_zero() {
            return if cancel.is_cancelled() {
                WaitOutcome::Cancelled
            } else {
                WaitOutcome::Elapsed
            };
        }
        cancel.wait_timeout(duration)
    }
}

/// Virtual clock for tests: waits advance time instantly and are recorded.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    base: Instant,
    wall_base: DateTime<Utc>,
    offset: Duration,
    waits: Vec<Duration>,
    cancel_after_waits: Option<usize>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    #[must_use]
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                wall_base: wall,
                offset: Duration::ZERO,
                waits: Vec::new(),
                cancel_after_waits: None,
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.with_state(|state| state.offset += by);
    }

    /// Total virtual time elapsed.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.with_state(|state| state.offset)
    }

    /// Every non-zero wait requested so far.
    #[must_use]
    pub fn waits(&self) -> Vec<Duration> {
        self.with_state(|state| state.waits.clone())
    }

    /// Report the `n`th wait (1-based) and every later one as cancelled.
    pub fn cancel_on_wait(&self, n: usize) {
        self.with_state(|state| state.cancel_after_waits = Some(n));
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ManualState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.with_state(|state| state.base + state.offset)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.with_state(|state| {
            let offset = chrono::Duration::from_std(state.offset).unwrap_or(chrono::Duration::zero());
            state.wall_base + offset
        })
    }

    fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if duration.is_zero() {
            return WaitOutcome::Elapsed;
        }
        self.with_state(|state| {
            state.waits.push(duration);
            if state
                .cancel_after_waits
                .is_some_and(|n| state.waits.len() >= n)
            {
                return WaitOutcome::Cancelled;
            }
            state.offset += duration;
            WaitOutcome::Elapsed
        })
    }
}
