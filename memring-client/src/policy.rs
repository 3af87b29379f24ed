//! Failure policy: retry decisions and per-node circuit breaking.
//!
//! The retry side is stateless: given the error and the attempt number it
//! answers `Retry(after)` or `GiveUp`. The breaker side is per-node state:
//! after enough consecutive failures a node is suspended and skipped without
//! a network attempt until its cool-down elapses, then exactly one probe is
//! allowed through.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::{BreakerOptions, RetryOptions};
use crate::error::Error;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// Surface the error to the caller.
    GiveUp,
}

/// Stateless retry policy with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    opts: RetryOptions,
}

impl RetryPolicy {
    pub fn new(opts: RetryOptions) -> Self {
        RetryPolicy { opts }
    }

    /// Decides whether attempt number `attempt` (zero-based) should be
    /// retried after `error`. Non-transient errors are never retried.
    pub fn decide(&self, error: &Error, attempt: u32) -> RetryDecision {
        if !error.is_transient() || attempt >= self.opts.max_retries {
            return RetryDecision::GiveUp;
        }

        let exp = self
            .opts
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.opts.max_backoff);

        // Half fixed, half jittered, so concurrent retries spread out.
        let half = exp / 2;
        let jitter_range = half.as_millis() as u64;
        let jitter = if jitter_range == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_range))
        };

        RetryDecision::Retry(half + jitter)
    }
}

/// Node health as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// Requests flow normally.
    Healthy,
    /// Suspended; calls fail fast until the cool-down elapses.
    Suspect,
    /// A probe after cool-down also failed; still suspended.
    Down,
}

struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    probe_failed: bool,
}

/// Per-node circuit breaker.
pub struct CircuitBreaker {
    addr: String,
    opts: BreakerOptions,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(addr: impl Into<String>, opts: BreakerOptions) -> Self {
        CircuitBreaker {
            addr: addr.into(),
            opts,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                probe_failed: false,
            }),
        }
    }

    /// Whether a request may proceed. While open, only the first caller
    /// after the cool-down gets through, as the probe.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let Some(opened_at) = state.opened_at else {
            return true;
        };
        if state.probe_in_flight || opened_at.elapsed() < self.opts.cooldown {
            return false;
        }
        state.probe_in_flight = true;
        debug!(addr = %self.addr, "circuit breaker probing node");
        true
    }

    /// Records a successful exchange; closes the breaker.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.opened_at.is_some() {
            debug!(addr = %self.addr, "node restored to healthy");
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
        state.probe_failed = false;
    }

    /// Records a transient failure; opens the breaker at the threshold and
    /// re-opens it when a probe fails.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.probe_in_flight {
            state.probe_in_flight = false;
            state.probe_failed = true;
            state.opened_at = Some(Instant::now());
            warn!(addr = %self.addr, "probe failed, node stays suspended");
            return;
        }

        if state.opened_at.is_none() && state.consecutive_failures >= self.opts.failure_threshold {
            state.opened_at = Some(Instant::now());
            warn!(
                addr = %self.addr,
                failures = state.consecutive_failures,
                "node suspended after consecutive failures"
            );
        }
    }

    /// Current health classification for this node.
    pub fn health(&self) -> NodeHealth {
        let state = self.state.lock();
        match state.opened_at {
            None => NodeHealth::Healthy,
            Some(_) if state.probe_failed => NodeHealth::Down,
            Some(_) => NodeHealth::Suspect,
        }
    }
}
