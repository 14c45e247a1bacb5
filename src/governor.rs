//! Adaptive concurrency budget reacting to insurer throttling signals.
//!
//! Every outbound shipment call holds a [`Permit`]. The governor starts at
//! the configured ceiling; a throttling signal (HTTP 429/503 or the
//! insurer's fault equivalent) halves the budget toward the floor and
//! doubles a capped backoff delay. A streak of consecutive successes grows
//! the budget back by one slot at a time and halves the delay.
//!
//! Waiters park on a `Notify` (no busy-waiting) and are woken when a permit
//! is returned or the budget grows. One instance per run, shared via `Arc`;
//! there is deliberately no global state.

use crate::util::stop::StopSignal;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Outcome of one outbound call, as observed by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The insurer signalled throttling.
    Throttled,
    /// Non-throttle failure (timeout, fault). Breaks the success streak
    /// without shrinking the budget.
    Failure,
}

/// Bounds and pacing knobs, normally derived from
/// [`crate::config::GovernorConfig`].
#[derive(Debug, Clone, Copy)]
pub struct GovernorLimits {
    pub ceiling: usize,
    pub floor: usize,
    /// Consecutive successes needed before the budget grows by one.
    pub recovery_streak: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        crate::config::GovernorConfig::default().limits()
    }
}

#[derive(Debug)]
struct State {
    /// Current concurrency budget, floor ≤ limit ≤ ceiling.
    limit: usize,
    /// Permits currently held.
    in_flight: usize,
    streak: u32,
    /// Zero when no backoff is active.
    delay: Duration,
}

/// Shared rate-limiting state for one run's workers.
#[derive(Debug)]
pub struct RateGovernor {
    state: Mutex<State>,
    notify: Notify,
    limits: GovernorLimits,
}

/// An acquired concurrency slot. Returning it (drop) wakes one waiter.
#[derive(Debug)]
pub struct Permit<'a> {
    governor: &'a RateGovernor,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut s = self.governor.lock();
        s.in_flight = s.in_flight.saturating_sub(1);
        drop(s);
        self.governor.notify.notify_waiters();
    }
}

impl RateGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        debug_assert!(limits.floor >= 1 && limits.floor <= limits.ceiling);
        Self {
            state: Mutex::new(State {
                limit: limits.ceiling,
                in_flight: 0,
                streak: 0,
                delay: Duration::ZERO,
            }),
            notify: Notify::new(),
            limits,
        }
    }

    /// Block until a concurrency slot is free or the stop signal fires.
    ///
    /// Returns `None` on cancellation.
    pub async fn acquire(&self, stop: &StopSignal) -> Option<Permit<'_>> {
        loop {
            // Register interest before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let mut s = self.lock();
                if s.in_flight < s.limit {
                    s.in_flight += 1;
                    return Some(Permit { governor: self });
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = stop.wait() => return None,
            }
        }
    }

    /// Record the outcome of one outbound call.
    pub fn report(&self, outcome: Outcome) {
        let mut s = self.lock();
        match outcome {
            Outcome::Throttled => {
                let old = s.limit;
                s.limit = (s.limit / 2).max(self.limits.floor);
                s.delay = if s.delay.is_zero() {
                    self.limits.backoff_base
                } else {
                    (s.delay * 2).min(self.limits.backoff_cap)
                };
                s.streak = 0;
                warn!(
                    old_limit = old,
                    new_limit = s.limit,
                    delay_ms = s.delay.as_millis() as u64,
                    "throttling signal, shrinking concurrency"
                );
            }
            Outcome::Success => {
                s.streak += 1;
                if s.streak >= self.limits.recovery_streak {
                    s.streak = 0;
                    if s.limit < self.limits.ceiling {
                        s.limit += 1;
                        debug!(limit = s.limit, "concurrency budget recovered one slot");
                    }
                    s.delay = halve_delay(s.delay, self.limits.backoff_base);
                }
            }
            Outcome::Failure => {
                s.streak = 0;
            }
        }
        drop(s);
        // Budget may have grown, wake parked workers.
        self.notify.notify_waiters();
    }

    /// Current concurrency budget (for tests and pool sizing decisions).
    pub fn current_limit(&self) -> usize {
        self.lock().limit
    }

    /// Current backoff delay, zero when no throttling is active.
    pub fn current_delay(&self) -> Duration {
        self.lock().delay
    }

    /// Backoff delay with ±20 % jitter, applied by workers before dispatch
    /// while throttling is active. Jitter keeps shrunk pools from
    /// re-synchronising their requests.
    pub fn dispatch_delay(&self) -> Duration {
        let delay = self.current_delay();
        if delay.is_zero() {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        delay.mul_f64(jitter)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn halve_delay(delay: Duration, base: Duration) -> Duration {
    let halved = delay / 2;
    if halved < base {
        Duration::ZERO
    } else {
        halved
    }
}
