//! Per-dependency circuit breaker.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Rejection returned while the breaker is open or half-open probes are
/// exhausted.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for dependency {dependency}")]
pub struct CircuitOpenError {
    /// Dependency the breaker guards.
    pub dependency: String,
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker from closed.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting probes.
    pub open_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_probes: u32,
    /// Probe successes required to close.
    pub success_threshold: u32,
    /// Windowed failure ratio that also trips the breaker.
    pub failure_ratio: f64,
    /// Outcome window size for the ratio check.
    pub window: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_probes: 3,
            success_threshold: 2,
            failure_ratio: 0.5,
            window: 10,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through; outcomes are tracked.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A bounded number of probes is admitted.
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    outcomes: VecDeque<bool>,
    probes_in_flight: u32,
    probe_successes: u32,
}

/// Adaptive guard in front of one outbound dependency.
///
/// Every failure counts against the breaker, so callers should wrap only
/// infrastructure operations, not command validation.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker for a named dependency.
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                outcomes: VecDeque::new(),
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    /// Current state, transitioning open → half-open if the cool-down
    /// lapsed.
    pub async fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().await;
        self.roll_state(&mut inner);
        match inner.state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// While open, returns [`CircuitOpenError`] without invoking `op`.
    /// While half-open, admits at most `half_open_probes` concurrent probes.
    pub async fn call<T, F, Fut>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let probing = {
            let mut inner = self.inner.lock().await;
            self.roll_state(&mut inner);
            match inner.state {
                State::Open { .. } => {
                    return Err(CircuitOpenError {
                        dependency: self.dependency.clone(),
                    }
                    .into());
                }
                State::HalfOpen => {
                    if inner.probes_in_flight >= self.config.half_open_probes {
                        return Err(CircuitOpenError {
                            dependency: self.dependency.clone(),
                        }
                        .into());
                    }
                    inner.probes_in_flight += 1;
                    true
                }
                State::Closed => false,
            }
        };

        let result = op().await;

        let mut inner = self.inner.lock().await;
        match (&result, probing) {
            (Ok(_), true) => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    info!(dependency = %self.dependency, "circuit closed after successful probes");
                    self.reset_closed(&mut inner);
                }
            }
            (Ok(_), false) => {
                inner.consecutive_failures = 0;
                self.push_outcome(&mut inner, true);
            }
            (Err(_), true) => {
                warn!(dependency = %self.dependency, "probe failed, re-opening circuit");
                self.trip(&mut inner);
            }
            (Err(_), false) => {
                inner.consecutive_failures += 1;
                self.push_outcome(&mut inner, false);
                if self.should_trip(&inner) {
                    warn!(
                        dependency = %self.dependency,
                        consecutive = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    self.trip(&mut inner);
                }
            }
        }
        result
    }

    fn roll_state(&self, inner: &mut Inner) {
        if let State::Open { until } = inner.state {
            if Instant::now() >= until {
                inner.state = State::HalfOpen;
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
            }
        }
    }

    fn push_outcome(&self, inner: &mut Inner, success: bool) {
        inner.outcomes.push_back(success);
        while inner.outcomes.len() > self.config.window {
            inner.outcomes.pop_front();
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        if inner.outcomes.len() >= self.config.window {
            let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
            let ratio = failures as f64 / inner.outcomes.len() as f64;
            return ratio >= self.config.failure_ratio;
        }
        false
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = State::Open {
            until: Instant::now() + self.config.open_timeout,
        };
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }

    fn reset_closed(&self, inner: &mut Inner) {
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.outcomes.clear();
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }
}

/// Process-local registry handing out one breaker per dependency name.
#[derive(Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Registry creating breakers with `config`.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Fetch or create the breaker for a dependency.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(dependency, self.config.clone()))
            })
            .clone()
    }
}
