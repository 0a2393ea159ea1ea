//! Per-target circuit breakers.
//!
//! ```text
//! CLOSED    --(failures >= threshold within monitoring period)--> OPEN
//! OPEN      --(recovery timeout elapsed, next call)-------------> HALF_OPEN
//! HALF_OPEN --(trial succeeds)-----------------------------------> CLOSED
//! HALF_OPEN --(trial fails)--------------------------------------> OPEN
//! ```
//!
//! Only failures whose code is in the configured expected set count; any other outcome
//! means the upstream answered and is treated as a success.

use crate::constants::breaker as defaults;
use crate::errors::{ErrorCode, RequestError};
use crate::services::logger::Logger;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub monitoring_period: Duration,
    pub expected_codes: HashSet<ErrorCode>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_millis(defaults::RECOVERY_TIMEOUT_MS),
            monitoring_period: Duration::from_millis(defaults::MONITORING_PERIOD_MS),
            expected_codes: [
                ErrorCode::NetworkError,
                ErrorCode::TimeoutError,
                ErrorCode::ServerError,
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub last_failure_at: Option<String>,
    pub next_attempt_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_requests: u64,
    rejected_requests: u64,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<chrono::DateTime<chrono::Utc>>,
    next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
    // Id of the most recent trial; survives `reset` so stale trials never match.
    trial_seq: u64,
    last_error: Option<(ErrorCode, String)>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            rejected_requests: 0,
            last_failure_at: None,
            last_failure_wall: None,
            next_attempt_at: None,
            trial_in_flight: false,
            trial_seq: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial(u64),
}

pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    logger: Logger,
    state: Mutex<BreakerState>,
}

/// Releases the half-open trial slot if the trial future is dropped before it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.trial {
            let mut state = self.breaker.lock();
            if state.state == CircuitState::HalfOpen && state.trial_seq == id {
                state.trial_in_flight = false;
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig, logger: Logger) -> Self {
        Self {
            target: target.into(),
            config,
            logger: logger.child("breaker"),
            state: Mutex::new(BreakerState::closed()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_expected(&self, err: &RequestError) -> bool {
        self.config.expected_codes.contains(&err.code)
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            trial: match admission {
                Admission::Trial(id) => Some(id),
                Admission::Normal => None,
            },
        };
        let result = operation().await;
        guard.trial = None;
        match &result {
            Ok(_) => self.record_success(admission),
            Err(err) => self.record_failure(admission, err),
        }
        result
    }

    fn admit(&self) -> Result<Admission, RequestError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.total_requests += 1;
        let current = state.state;
        match current {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let ready = state.next_attempt_at.map(|at| now >= at).unwrap_or(true);
                if ready {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    state.trial_seq += 1;
                    let id = state.trial_seq;
                    drop(state);
                    self.logger.info(
                        "Circuit half-open, admitting trial call",
                        Some(&serde_json::json!({"target": self.target})),
                    );
                    Ok(Admission::Trial(id))
                } else {
                    state.rejected_requests += 1;
                    Err(self.open_error(&state, now))
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    state.rejected_requests += 1;
                    Err(self.open_error(&state, now))
                } else {
                    state.trial_in_flight = true;
                    state.trial_seq += 1;
                    Ok(Admission::Trial(state.trial_seq))
                }
            }
        }
    }

    /// Whether this outcome may move the state machine. Only the current trial decides a
    /// half-open breaker; calls admitted earlier only count while the breaker is closed.
    fn decides(state: &BreakerState, admission: Admission) -> bool {
        match (admission, state.state) {
            (_, CircuitState::Closed) => true,
            (Admission::Trial(id), CircuitState::HalfOpen) => state.trial_seq == id,
            _ => false,
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut state = self.lock();
        state.success_count += 1;
        if !Self::decides(&state, admission) {
            return;
        }
        let current = state.state;
        match current {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.success_count = 0;
                state.trial_in_flight = false;
                state.next_attempt_at = None;
                drop(state);
                self.logger.info(
                    "Circuit closed after successful trial",
                    Some(&serde_json::json!({"target": self.target})),
                );
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, admission: Admission, err: &RequestError) {
        if !self.is_expected(err) {
            self.record_success(admission);
            return;
        }
        let now = Instant::now();
        let mut state = self.lock();
        let window_elapsed = state
            .last_failure_at
            .map(|last| now.duration_since(last) > self.config.monitoring_period)
            .unwrap_or(false);
        state.last_error = Some((err.code, err.message.clone()));
        state.last_failure_at = Some(now);
        state.last_failure_wall = Some(chrono::Utc::now());
        if !Self::decides(&state, admission) {
            return;
        }
        let current = state.state;
        match current {
            CircuitState::HalfOpen => self.trip(&mut state, now),
            CircuitState::Closed => {
                if window_elapsed {
                    state.failure_count = 0;
                }
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.trip(&mut state, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.trial_in_flight = false;
        state.next_attempt_at = Some(now + self.config.recovery_timeout);
        self.logger.warn(
            "Circuit opened",
            Some(&serde_json::json!({
                "target": self.target,
                "failure_count": state.failure_count,
                "recovery_timeout_ms": millis(self.config.recovery_timeout),
            })),
        );
    }

    fn open_error(&self, state: &BreakerState, now: Instant) -> RequestError {
        let retry_after_ms = state
            .next_attempt_at
            .map(|at| millis(at.saturating_duration_since(now)))
            .unwrap_or(0);
        let (code, last_message) = state
            .last_error
            .clone()
            .unwrap_or((ErrorCode::ServerError, "upstream unavailable".to_string()));
        let phase = match state.state {
            CircuitState::HalfOpen => "half_open",
            _ => "open",
        };
        RequestError::new(
            code,
            format!("Circuit open for {}: {}", self.target, last_message),
        )
        .with_recoverable(true)
        .with_retryable(false)
        .with_retry_after(retry_after_ms)
        .with_details(serde_json::json!({
            "circuit": phase,
            "target": self.target,
            "failure_count": state.failure_count,
        }))
    }

    pub fn reset(&self) {
        {
            let mut state = self.lock();
            let trial_seq = state.trial_seq;
            *state = BreakerState::closed();
            state.trial_seq = trial_seq;
        }
        self.logger.info(
            "Circuit reset",
            Some(&serde_json::json!({"target": self.target})),
        );
    }

    pub fn force_open(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        self.trip(&mut state, now);
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let state = self.lock();
        BreakerStats {
            target: self.target.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_requests: state.total_requests,
            rejected_requests: state.rejected_requests,
            last_failure_at: state.last_failure_wall.map(|at| at.to_rfc3339()),
            next_attempt_in_ms: match state.state {
                CircuitState::Open => state
                    .next_attempt_at
                    .map(|at| millis(at.saturating_duration_since(now))),
                _ => None,
            },
        }
    }
}

/// Breakers keyed by upstream target, created on first use.
pub struct CircuitBreakerRegistry {
    logger: Logger,
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, logger: Logger) -> Self {
        Self {
            logger,
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return existing.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target,
                    self.config.clone(),
                    self.logger.clone(),
                ))
            })
            .clone()
    }

    pub fn peek(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| b.clone())
    }

    /// Resets one target, or every known target when `target` is `None`.
    pub fn reset(&self, target: Option<&str>) -> usize {
        match target {
            Some(target) => match self.peek(target) {
                Some(breaker) => {
                    breaker.reset();
                    1
                }
                None => 0,
            },
            None => {
                let all: Vec<Arc<CircuitBreaker>> =
                    self.breakers.iter().map(|b| b.value().clone()).collect();
                for breaker in &all {
                    breaker.reset();
                }
                all.len()
            }
        }
    }

    pub fn force_open(&self, target: &str) {
        self.get(target).force_open();
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut out: Vec<BreakerStats> = self.breakers.iter().map(|b| b.value().stats()).collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }
}

/// Stable breaker key for an upstream URL: `host:port`.
pub fn target_for_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    match url.port_or_known_default() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
