//! Request pacing as an explicit state machine.
//!
//! ```text
//!            burst of `cooldown_after` requests
//!   Active ─────────────────────────────────────▶ Cooldown ──(elapsed)──▶ Active
//!     │  failures reach threshold / detection            │
//!     ├──────────────────────────────────────────────────┴──▶ LongBreak ──(elapsed)──▶ Active
//!     │  long breaks exhausted, or stop requested
//!     └──────────────────────────────────────────────────────▶ Halted
//! ```
//!
//! The one-minute request cap adapts: each failure scales it down toward
//! `min_requests_per_minute`, each success scales it back up toward
//! `requests_per_minute`.
//!
//! The controller never sleeps. It tells the caller how long to wait, and the caller
//! waits through a cancellable [`Clock`].

pub mod clock;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::constants::{FAILURE_BACKOFF_CAP, RATE_WINDOW_MS};
use crate::types::PacingConfig;

pub use clock::{CancellationToken, Clock, ManualClock, SystemClock, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingState {
    Active,
    Cooldown { until: Instant },
    LongBreak { until: Instant },
    Halted,
}

impl PacingState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooldown { .. } => "cooldown",
            Self::LongBreak { .. } => "long_break",
            Self::Halted => "halted",
        }
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted)
    }
}

/// What the caller should do before its next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// Issue the request after `delay`.
    Proceed { delay: Duration },
    /// Do not request yet; ask again after `duration`.
    Wait { duration: Duration },
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network hiccup, missed parse and similar. Counts toward the failure threshold.
    Transient,
    /// Block page or CAPTCHA. Forces a long break.
    Detected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingStats {
    pub state: PacingState,
    pub requests_last_minute: usize,
    /// Current adaptive cap; zero when the window is disabled.
    pub current_rate_limit: usize,
    pub consecutive_requests: u32,
    pub consecutive_failures: u32,
    pub long_breaks_taken: u32,
    pub cooldowns_entered: u64,
    pub total_requests: u64,
}

#[derive(Debug)]
pub struct PacingController {
    config: PacingConfig,
    state: PacingState,
    consecutive_requests: u32,
    consecutive_failures: u32,
    long_breaks_taken: u32,
    cooldowns_entered: u64,
    total_requests: u64,
    window: VecDeque<Instant>,
    current_rate: f64,
    rng: StdRng,
}

impl PacingController {
    #[must_use]
    pub fn new(config: PacingConfig) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let capacity = config.requests_per_minute as usize;
        let current_rate = f64::from(config.requests_per_minute);
        Self {
            config,
            state: PacingState::Active,
            consecutive_requests: 0,
            consecutive_failures: 0,
            long_breaks_taken: 0,
            cooldowns_entered: 0,
            total_requests: 0,
            window: VecDeque::with_capacity(capacity),
            current_rate,
            rng,
        }
    }

    #[must_use]
    pub fn state(&self) -> PacingState {
        self.state
    }

    /// Decide what happens next. Elapsed pauses return to `Active` here.
    pub fn next_action(&mut self, now: Instant) -> PacingDecision {
        match self.state {
            PacingState::Halted => return PacingDecision::Halt,
            PacingState::Cooldown { until } => {
                if now < until {
                    return PacingDecision::Wait {
                        duration: until - now,
                    };
                }
                self.consecutive_requests = 0;
                self.transition(PacingState::Active);
            }
            PacingState::LongBreak { until } => {
                if now < until {
                    return PacingDecision::Wait {
                        duration: until - now,
                    };
                }
                self.consecutive_failures = 0;
                self.consecutive_requests = 0;
                self.transition(PacingState::Active);
            }
            PacingState::Active => {}
        }

        if let Some(duration) = self.window_wait(now) {
            return PacingDecision::Wait { duration };
        }
        PacingDecision::Proceed {
            delay: self.jitter(),
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        self.note_request(now);
        self.scale_rate(self.config.rate_recovery_percent);
        self.consecutive_failures = 0;
        self.long_breaks_taken = 0;
        self.maybe_cool_down(now);
    }

    pub fn record_failure(&mut self, kind: FailureKind, now: Instant) {
        self.note_request(now);
        self.scale_rate(self.config.rate_decay_percent);
        if self.state.is_halted() {
            return;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        tracing::debug!(
            pacing.failures = self.consecutive_failures,
            pacing.kind = ?kind,
            "request failed"
        );
        match kind {
            FailureKind::Detected => self.enter_long_break(now),
            FailureKind::Transient if self.consecutive_failures >= self.config.failure_threshold => {
                self.enter_long_break(now);
            }
            FailureKind::Transient => self.maybe_cool_down(now),
        }
    }

    /// Move to `Halted`; no further requests are allowed.
    pub fn request_stop(&mut self) {
        if !self.state.is_halted() {
            tracing::info!("pacing stop requested");
            self.transition(PacingState::Halted);
        }
    }

    #[must_use]
    pub fn stats(&self) -> PacingStats {
        PacingStats {
            state: self.state,
            requests_last_minute: self.window.len(),
            current_rate_limit: self.rate_limit(),
            consecutive_requests: self.consecutive_requests,
            consecutive_failures: self.consecutive_failures,
            long_breaks_taken: self.long_breaks_taken,
            cooldowns_entered: self.cooldowns_entered,
            total_requests: self.total_requests,
        }
    }

    fn note_request(&mut self, now: Instant) {
        self.total_requests += 1;
        self.consecutive_requests = self.consecutive_requests.saturating_add(1);
        let limit = self.config.requests_per_minute as usize;
        if limit > 0 {
            self.window.push_back(now);
            while self.window.len() > limit {
                self.window.pop_front();
            }
        }
    }

    fn scale_rate(&mut self, percent: u32) {
        let ceiling = self.config.requests_per_minute;
        if ceiling == 0 {
            return;
        }
        let floor = f64::from(self.config.min_requests_per_minute.clamp(1, ceiling));
        let previous = self.rate_limit();
        self.current_rate =
            (self.current_rate * f64::from(percent) / 100.0).clamp(floor, f64::from(ceiling));
        if self.rate_limit() != previous {
            tracing::debug!(
                pacing.rate_limit = self.rate_limit(),
                pacing.previous = previous,
                "request cap adjusted"
            );
        }
    }

    /// Requests allowed in the sliding window right now; zero disables it.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn rate_limit(&self) -> usize {
        if self.config.requests_per_minute == 0 {
            return 0;
        }
        (self.current_rate.floor() as usize).max(1)
    }

    fn maybe_cool_down(&mut self, now: Instant) {
        if self.state == PacingState::Active
            && self.consecutive_requests >= self.config.cooldown_after
        {
            self.cooldowns_entered += 1;
            let until = now + Duration::from_millis(self.config.cooldown_ms);
            self.transition(PacingState::Cooldown { until });
        }
    }

    fn enter_long_break(&mut self, now: Instant) {
        if self.long_breaks_taken >= self.config.max_long_breaks {
            tracing::warn!(
                pacing.long_breaks = self.long_breaks_taken,
                "long breaks exhausted; halting"
            );
            self.transition(PacingState::Halted);
            return;
        }
        self.long_breaks_taken += 1;
        let shift = (self.long_breaks_taken - 1).min(32);
        let millis = self
            .config
            .long_break_ms
            .saturating_mul(1u64 << shift)
            .min(self.config.max_long_break_ms);
        self.transition(PacingState::LongBreak {
            until: now + Duration::from_millis(millis),
        });
        tracing::warn!(
            pacing.break_ms = millis,
            pacing.long_breaks = self.long_breaks_taken,
            "entering long break"
        );
    }

    fn window_wait(&mut self, now: Instant) -> Option<Duration> {
        let limit = self.rate_limit();
        if limit == 0 {
            return None;
        }
        let span = Duration::from_millis(RATE_WINDOW_MS);
        while self
            .window
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= span)
        {
            self.window.pop_front();
        }
        if self.window.len() < limit {
            return None;
        }
        let blocking = *self.window.get(self.window.len() - limit)?;
        Some((blocking + span).saturating_duration_since(now))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn jitter(&mut self) -> Duration {
        let min = self.config.min_jitter_ms;
        let max = self.config.max_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        let millis = if self.consecutive_failures == 0 {
            self.rng.gen_range(min..=max)
        } else {
            let factor = (1u64 << self.consecutive_failures.min(8)).min(FAILURE_BACKOFF_CAP);
            let base = min.saturating_mul(factor) as f64;
            let spread = self.rng.gen_range(-0.3..=0.3) * base;
            ((base + spread).max(0.0) as u64).clamp(min, max)
        };
        Duration::from_millis(millis)
    }

    fn transition(&mut self, next: PacingState) {
        if self.state != next {
            tracing::debug!(
                pacing.from = self.state.name(),
                pacing.to = next.name(),
                "pacing transition"
            );
        }
        self.state = next;
    }
}
