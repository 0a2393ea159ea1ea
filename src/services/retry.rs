use crate::constants::retry as defaults;
use crate::errors::{ErrorCode, RequestError};
use crate::services::logger::Logger;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retryable_codes: HashSet<ErrorCode>,
    /// Per-attempt deadline; an attempt that overruns fails with `TIMEOUT_ERROR`.
    pub timeout: Option<Duration>,
    pub respect_retry_after: bool,
}

fn default_retryable() -> HashSet<ErrorCode> {
    [
        ErrorCode::NetworkError,
        ErrorCode::TimeoutError,
        ErrorCode::ServerError,
    ]
    .into_iter()
    .collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::http()
    }
}

impl RetryConfig {
    pub fn http() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::MAX_DELAY_MS),
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            retryable_codes: default_retryable(),
            timeout: None,
            respect_retry_after: true,
        }
    }

    /// Slow upstream systems: more attempts, longer waits.
    pub fn upstream() -> Self {
        Self {
            max_attempts: defaults::upstream::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::upstream::BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::upstream::MAX_DELAY_MS),
            ..Self::http()
        }
    }

    pub fn cache() -> Self {
        Self {
            max_attempts: defaults::cache::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::cache::BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::cache::MAX_DELAY_MS),
            retryable_codes: [ErrorCode::NetworkError, ErrorCode::TimeoutError]
                .into_iter()
                .collect(),
            respect_retry_after: false,
            ..Self::http()
        }
    }

    pub fn bulk() -> Self {
        Self {
            max_attempts: defaults::bulk::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::bulk::BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::bulk::MAX_DELAY_MS),
            backoff_multiplier: defaults::bulk::BACKOFF_MULTIPLIER,
            ..Self::http()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "http" | "default" => Some(Self::http()),
            "upstream" => Some(Self::upstream()),
            "cache" => Some(Self::cache()),
            "bulk" => Some(Self::bulk()),
            _ => None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The error's own `retryable` flag wins over the code-based default.
    pub fn is_retryable(&self, err: &RequestError) -> bool {
        err.retryable
            .unwrap_or_else(|| self.retryable_codes.contains(&err.code))
    }

    /// Wait before attempt `attempt + 1`. A `Retry-After` hint can stretch the wait up to
    /// `max_delay`, never past it.
    pub fn delay_for(&self, attempt: u32, err: Option<&RequestError>) -> Duration {
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let base = self.base_delay.as_millis() as f64;
        let exp = self
            .backoff_multiplier
            .max(1.0)
            .powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
        let capped = (base * exp).min(max_ms as f64);
        let mut delay_ms = if capped.is_finite() { capped.max(0.0) as u64 } else { max_ms };
        if self.respect_retry_after {
            if let Some(after) = err.and_then(|e| e.retry_after_ms) {
                delay_ms = delay_ms.max(after.min(max_ms));
            }
        }
        Duration::from_millis(delay_ms)
    }
}

/// Handed to `on_retry` before each backoff wait.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: RequestError,
    pub elapsed: Duration,
    pub next_delay: Duration,
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, RequestError>,
    pub attempts: u32,
    pub fallback_used: bool,
    pub elapsed: Duration,
}

type RetryHook<'a> = Box<dyn Fn(&RetryAttempt) + Send + Sync + 'a>;
type FallbackHook<'a> = Box<dyn Fn(&RequestError) + Send + Sync + 'a>;

pub struct RetryOptions<'a, T> {
    on_retry: Option<RetryHook<'a>>,
    on_fallback: Option<FallbackHook<'a>>,
    fallback: Option<BoxFuture<'a, Result<T, RequestError>>>,
}

impl<T> Default for RetryOptions<'_, T> {
    fn default() -> Self {
        Self {
            on_retry: None,
            on_fallback: None,
            fallback: None,
        }
    }
}

impl<'a, T> RetryOptions<'a, T> {
    pub fn on_retry(mut self, hook: impl Fn(&RetryAttempt) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn on_fallback(mut self, hook: impl Fn(&RequestError) + Send + Sync + 'a) -> Self {
        self.on_fallback = Some(Box::new(hook));
        self
    }

    /// Runs once, only if every attempt failed.
    pub fn fallback(mut self, fallback: impl Future<Output = Result<T, RequestError>> + Send + 'a) -> Self {
        self.fallback = Some(Box::pin(fallback));
        self
    }
}

#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    logger: Logger,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, logger: Logger) -> Self {
        Self {
            config,
            logger: logger.child("retry"),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Same executor with a different attempt budget, used for per-call overrides.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            config: self.config.clone().with_max_attempts(max_attempts),
            logger: self.logger.clone(),
        }
    }

    async fn run_attempt<T, Fut>(&self, attempt: u32, fut: Fut) -> Result<T, RequestError>
    where
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let Some(limit) = self.config.timeout else {
            return fut.await;
        };
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::timeout(format!(
                "Attempt {} did not settle within {}ms",
                attempt,
                limit.as_millis()
            ))
            .with_detail("attempt_timeout_ms", serde_json::json!(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)))),
        }
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F, options: RetryOptions<'_, T>) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        let last_error = loop {
            attempt += 1;
            let err = match self.run_attempt(attempt, operation(attempt)).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        fallback_used: false,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) => err,
            };

            let retryable = self.config.is_retryable(&err);
            if !retryable {
                break err;
            }
            if attempt >= max_attempts {
                if max_attempts > 1 {
                    self.logger.warn(
                        "Retries exhausted",
                        Some(&serde_json::json!({"attempts": attempt, "code": err.code})),
                    );
                    break err.with_detail(
                        "retry",
                        serde_json::json!({"attempts": attempt, "exhausted": true}),
                    );
                }
                break err;
            }

            let delay = self.config.delay_for(attempt, Some(&err));
            let record = RetryAttempt {
                attempt,
                error: err,
                elapsed: started.elapsed(),
                next_delay: delay,
            };
            self.logger.debug(
                "Retrying after failure",
                Some(&serde_json::json!({
                    "attempt": attempt,
                    "code": record.error.code,
                    "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                })),
            );
            if let Some(hook) = &options.on_retry {
                hook(&record);
            }
            tokio::time::sleep(delay).await;
        };

        match options.fallback {
            Some(fallback) => {
                if let Some(hook) = &options.on_fallback {
                    hook(&last_error);
                }
                let result = fallback.await;
                let fallback_used = result.is_ok();
                RetryOutcome {
                    result,
                    attempts: attempt,
                    fallback_used,
                    elapsed: started.elapsed(),
                }
            }
            None => RetryOutcome {
                result: Err(last_error),
                attempts: attempt,
                fallback_used: false,
                elapsed: started.elapsed(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::logger::LogLevel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn executor(config: RetryConfig) -> RetryExecutor {
        RetryExecutor::new(config, Logger::new("test").with_level(LogLevel::Error))
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_exponentially_then_reports_exhaustion() {
        let exec = executor(RetryConfig::http());
        let calls = AtomicU32::new(0);
        let delays = Arc::new(Mutex::new(Vec::new()));
        let seen = delays.clone();

        let outcome = exec
            .execute(
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RequestError::server("502 from dispatcher"))
                },
                RetryOptions::default().on_retry(move |record| {
                    seen.lock().expect("lock").push(record.next_delay);
                }),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            *delays.lock().expect("lock"),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(outcome.elapsed, Duration::from_millis(3000));
        let err = outcome.result.expect_err("exhausted");
        assert_eq!(err.code, ErrorCode::ServerError);
        assert_eq!(
            err.detail("retry"),
            Some(&serde_json::json!({"attempts": 3, "exhausted": true}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_stop_immediately() {
        let exec = executor(RetryConfig::http());
        let calls = AtomicU32::new(0);
        let outcome = exec
            .execute(
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RequestError::validation("bad path"))
                },
                RetryOptions::default(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.expect_err("fails").detail("retry").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flag_overrides_classification() {
        let exec = executor(RetryConfig::http());
        let calls = AtomicU32::new(0);
        let outcome = exec
            .execute(
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RequestError::server("maintenance").with_retryable(false))
                },
                RetryOptions::default(),
            )
            .await;
        assert_eq!(outcome.attempts, 1);

        let outcome = exec
            .execute(
                |attempt| async move {
                    if attempt < 2 {
                        Err(RequestError::authentication("token race").with_retryable(true))
                    } else {
                        Ok(attempt)
                    }
                },
                RetryOptions::default(),
            )
            .await;
        assert_eq!(outcome.result.expect("second attempt"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_after_failure() {
        let exec = executor(RetryConfig::http().with_max_attempts(2));
        let fallback_seen = Arc::new(AtomicU32::new(0));
        let hook_count = fallback_seen.clone();
        let outcome = exec
            .execute(
                |_| async { Err::<&str, _>(RequestError::network("refused")) },
                RetryOptions::default()
                    .on_fallback(move |_| {
                        hook_count.fetch_add(1, Ordering::SeqCst);
                    })
                    .fallback(async { Ok("stale copy") }),
            )
            .await;
        assert!(outcome.fallback_used);
        assert_eq!(outcome.result.expect("fallback value"), "stale copy");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(fallback_seen.load(Ordering::SeqCst), 1);

        let outcome = exec
            .execute(
                |_| async { Err::<&str, _>(RequestError::network("refused")) },
                RetryOptions::default()
                    .fallback(async { Err(RequestError::not_found("no stale copy")) }),
            )
            .await;
        assert!(!outcome.fallback_used);
        assert_eq!(
            outcome.result.expect_err("fallback failed").code,
            ErrorCode::NotFoundError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_are_retried() {
        let exec = executor(
            RetryConfig::http()
                .with_max_attempts(2)
                .with_timeout(Some(Duration::from_millis(500))),
        );
        let outcome = exec
            .execute(
                |attempt| async move {
                    if attempt == 1 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, RequestError>(attempt)
                },
                RetryOptions::default(),
            )
            .await;
        assert_eq!(outcome.result.expect("second attempt"), 2);
        assert_eq!(outcome.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn delay_is_capped_and_raised_by_retry_after() {
        let config = RetryConfig::http();
        assert_eq!(config.delay_for(1, None), Duration::from_millis(1000));
        assert_eq!(config.delay_for(3, None), Duration::from_millis(4000));
        assert_eq!(config.delay_for(10, None), Duration::from_millis(10_000));
        let throttled = RequestError::server("429").with_retry_after(7000);
        assert_eq!(config.delay_for(1, Some(&throttled)), Duration::from_millis(7000));
        let day = RequestError::server("429").with_retry_after(86_400_000);
        assert_eq!(config.delay_for(1, Some(&day)), Duration::from_millis(10_000));
        assert_eq!(
            RetryConfig::cache().delay_for(1, Some(&throttled)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn presets_resolve_by_name() {
        assert_eq!(RetryConfig::preset("upstream").map(|c| c.max_attempts), Some(5));
        assert_eq!(
            RetryConfig::preset("bulk").map(|c| c.backoff_multiplier),
            Some(1.5)
        );
        assert!(RetryConfig::preset("nope").is_none());
    }
}
