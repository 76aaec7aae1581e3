//! Circuit breaker for datastore protection
//!
//! This module implements a circuit breaker with three states:
//! - Closed: Normal operation, calls pass through
//! - Open: The resource is failing, calls are rejected without being attempted
//! - HalfOpen: Recovery is being tested with a single live probe
//!
//! Unlike a consecutive-failure breaker, the decision to open is made on the
//! failure *rate* observed inside a sliding time window, and only once the
//! window holds enough samples to be meaningful.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker '{name}' is open (retry in {retry_in:?})")]
    CircuitOpen { name: String, retry_in: Duration },

    #[error("Circuit breaker '{0}' already has a recovery probe in flight")]
    HalfOpenLimitReached(String),

    #[error("No backoff delays configured")]
    NoBackoffConfigured,
}

/// Outcome of [`CircuitBreaker::call`] when it does not succeed
#[derive(Debug)]
pub enum CallError<E> {
    /// The breaker refused the call; the wrapped function was never invoked
    Rejected(CircuitError),

    /// The wrapped function ran and failed; the failure has been recorded
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Rejected(e) => write!(f, "{}", e),
            CallError::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl<E> std::error::Error for CallError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Rejected(e) => Some(e),
            CallError::Failed(e) => Some(e),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Resource has failed - calls are rejected
    Open,

    /// Testing recovery - exactly one probe is allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0-1.0) that must be exceeded to open the circuit
    pub failure_threshold: f64,

    /// Time window over which successes and failures are counted
    pub failure_window: Duration,

    /// How long the circuit stays open before a probe is allowed
    pub recovery_timeout: Duration,

    /// Delay to wait before retry attempt N; the last entry repeats
    pub backoff_delays: Vec<Duration>,

    /// Minimum windowed samples before the failure rate is trusted;
    /// values below [`MIN_SAMPLES_FLOOR`] are raised to it
    pub min_samples: usize,
}

/// A single sample never opens the circuit
pub const MIN_SAMPLES_FLOOR: usize = 2;

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            backoff_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            min_samples: 2,
        }
    }
}

/// Mutable breaker bookkeeping, always accessed under the breaker lock
struct BreakerWindow {
    state: CircuitState,

    /// Failure timestamps younger than `failure_window`
    failures: VecDeque<Instant>,

    /// Success timestamps younger than `failure_window`
    successes: VecDeque<Instant>,

    opened_at: Option<Instant>,
    last_transition: Instant,

    /// Consecutive failures since the last success (the retry-attempt counter)
    consecutive_failures: u32,

    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
    open_count: u64,

    probe_in_flight: bool,
    probe_generation: u64,
}

impl BreakerWindow {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: VecDeque::new(),
            opened_at: None,
            last_transition: Instant::now(),
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
            open_count: 0,
            probe_in_flight: false,
            probe_generation: 0,
        }
    }

    /// Drop samples that fell out of the window
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&t) = self.failures.front() {
            if now.saturating_duration_since(t) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        while let Some(&t) = self.successes.front() {
            if now.saturating_duration_since(t) >= window {
                self.successes.pop_front();
            } else {
                break;
            }
        }
    }

    fn sample_count(&self) -> usize {
        self.failures.len() + self.successes.len()
    }

    fn failure_rate(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            return 0.0;
        }
        self.failures.len() as f64 / total as f64
    }

    fn should_attempt_reset(&self, now: Instant, recovery_timeout: Duration) -> bool {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                now.saturating_duration_since(opened_at) >= recovery_timeout
            }
            _ => false,
        }
    }

    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.open_count += 1;
        self.last_transition = now;
    }

    fn transition_to_half_open(&mut self, now: Instant) {
        self.state = CircuitState::HalfOpen;
        self.probe_in_flight = false;
        self.last_transition = now;
    }

    fn transition_to_closed(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.probe_in_flight = false;
        self.failures.clear();
        self.successes.clear();
        self.last_transition = now;
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,

    /// Current state
    pub state: CircuitState,

    /// Failures inside the current window
    pub failure_count: usize,

    /// Successes inside the current window
    pub success_count: usize,

    /// Windowed failure rate
    pub failure_rate: f64,

    pub consecutive_failures: u32,

    /// Lifetime counters
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,

    /// Number of times circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

/// Failure-rate circuit breaker protecting one named resource
///
/// All bookkeeping happens under a single mutex; [`CircuitBreaker::call`]
/// releases it before awaiting the protected work, so only the accounting is
/// serialized, never the calls themselves.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    window: Mutex<BreakerWindow>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named resource
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            window_secs = config.failure_window.as_secs_f64(),
            "Creating circuit breaker"
        );
        Self {
            name,
            config,
            window: Mutex::new(BreakerWindow::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under breaker protection
    ///
    /// An open circuit whose recovery timeout has elapsed moves to HalfOpen
    /// first; in HalfOpen only one caller is admitted as the probe. The
    /// outcome of `f` is recorded as a success or failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = self.admit().map_err(CallError::Rejected)?;
        let _guard = ProbeGuard {
            breaker: self,
            generation: probe,
        };

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CallError::Failed(e))
            }
        }
    }

    /// Decide whether a call may proceed; returns the probe generation when
    /// the caller was admitted as the HalfOpen probe
    fn admit(&self) -> Result<Option<u64>, CircuitError> {
        let mut window = self.lock();
        let now = Instant::now();

        if window.should_attempt_reset(now, self.config.recovery_timeout) {
            info!(breaker = %self.name, "Circuit transitioning from Open to HalfOpen");
            window.transition_to_half_open(now);
        }

        match window.state {
            CircuitState::Closed => Ok(None),

            CircuitState::Open => {
                window.total_rejected += 1;
                let retry_in = window
                    .opened_at
                    .map(|opened_at| {
                        (opened_at + self.config.recovery_timeout).saturating_duration_since(now)
                    })
                    .unwrap_or_default();
                debug!(breaker = %self.name, ?retry_in, "Rejecting call, circuit is open");
                Err(CircuitError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in,
                })
            }

            CircuitState::HalfOpen => {
                if window.probe_in_flight {
                    window.total_rejected += 1;
                    Err(CircuitError::HalfOpenLimitReached(self.name.clone()))
                } else {
                    window.probe_in_flight = true;
                    window.probe_generation += 1;
                    debug!(breaker = %self.name, "Admitting recovery probe");
                    Ok(Some(window.probe_generation))
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut window = self.lock();
        let now = Instant::now();

        window.total_successes += 1;
        window.consecutive_failures = 0;

        match window.state {
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Probe succeeded, circuit transitioning from HalfOpen to Closed");
                window.transition_to_closed(now);
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Recorded success while Open");
            }
            CircuitState::Closed => {}
        }

        window.successes.push_back(now);
        window.prune(now, self.config.failure_window);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut window = self.lock();
        let now = Instant::now();

        window.total_failures += 1;
        window.consecutive_failures += 1;
        window.failures.push_back(now);
        window.prune(now, self.config.failure_window);

        match window.state {
            CircuitState::Closed => {
                let samples = window.sample_count();
                let rate = window.failure_rate();
                debug!(
                    breaker = %self.name,
                    samples,
                    failure_rate = rate,
                    threshold = self.config.failure_threshold,
                    "Call failed in Closed state"
                );

                let min_samples = self.config.min_samples.max(MIN_SAMPLES_FLOOR);
                if samples >= min_samples && rate > self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        samples,
                        failure_rate = rate,
                        "Circuit transitioning from Closed to Open"
                    );
                    window.transition_to_open(now);
                }
            }

            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, reopening circuit");
                window.transition_to_open(now);
            }

            CircuitState::Open => {
                debug!(breaker = %self.name, "Call failed in Open state");
            }
        }
    }

    /// True only when Open and the recovery timeout has elapsed
    pub fn should_attempt_reset(&self) -> bool {
        self.lock()
            .should_attempt_reset(Instant::now(), self.config.recovery_timeout)
    }

    /// Backoff delay before retry `attempt` (0-based), clamped to the last
    /// configured delay
    pub fn get_backoff_delay(&self, attempt: usize) -> Result<Duration, CircuitError> {
        let delays = &self.config.backoff_delays;
        let last = delays.len().checked_sub(1).ok_or(CircuitError::NoBackoffConfigured)?;
        Ok(delays[attempt.min(last)])
    }

    /// Get the current circuit state
    pub fn get_state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get breaker statistics
    pub fn get_stats(&self) -> CircuitStats {
        let mut window = self.lock();
        window.prune(Instant::now(), self.config.failure_window);

        CircuitStats {
            name: self.name.clone(),
            state: window.state,
            failure_count: window.failures.len(),
            success_count: window.successes.len(),
            failure_rate: window.failure_rate(),
            consecutive_failures: window.consecutive_failures,
            total_successes: window.total_successes,
            total_failures: window.total_failures,
            total_rejected: window.total_rejected,
            open_count: window.open_count,
            time_in_state: window.last_transition.elapsed(),
        }
    }

    /// Manually reset the circuit to Closed with an empty window
    pub fn reset(&self) {
        let mut window = self.lock();
        info!(breaker = %self.name, "Manually resetting circuit to Closed");
        window.transition_to_closed(Instant::now());
        window.consecutive_failures = 0;
    }
}

/// Releases the HalfOpen probe slot if the probe's future is dropped before
/// its outcome was recorded
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation {
            let mut window = self.breaker.lock();
            if window.probe_in_flight && window.probe_generation == generation {
                window.probe_in_flight = false;
            }
        }
    }
}
