//! Request pipeline: cache check, auth, circuit breaker, retry, transport and normalization,
//! in that order, with every outcome folded into a [`ResponseEnvelope`].

mod envelope;
mod normalize;
mod options;

pub use envelope::{ResponseEnvelope, ResponseMetadata};
pub use normalize::{classify_message, classify_status, extract_message, normalize_response, parse_retry_after};
pub use options::{RequestContext, RequestOptions, RetrySetting};

use crate::constants::cache::KEY_PREFIX;
use crate::constants::redaction::MAX_DETAIL_STRING;
use crate::errors::{ErrorCode, RequestError};
use crate::services::auth::AuthManager;
use crate::services::cache::{CacheStats, CacheStore};
use crate::services::circuit_breaker::{target_for_url, BreakerStats, CircuitBreakerRegistry};
use crate::services::logger::Logger;
use crate::services::retry::{RetryExecutor, RetryOptions};
use crate::services::transport::{HttpMethod, Transport, TransportRequest};
use crate::utils::redact::redact_object;
use crate::utils::stable_json::stable_digest;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Debug, Default)]
struct PerformanceCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    circuit_rejections: AtomicU64,
    cache_write_failures: AtomicU64,
    total_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl PerformanceCounters {
    fn record(&self, success: bool, duration_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.max_duration_ms
            .fetch_max(duration_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PerformanceStats {
        let total = self.total.load(Ordering::Relaxed);
        let duration = self.total_duration_ms.load(Ordering::Relaxed);
        PerformanceStats {
            total_requests: total,
            successful: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
            average_duration_ms: if total == 0 {
                0.0
            } else {
                duration as f64 / total as f64
            },
            max_duration_ms: self.max_duration_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub circuit_rejections: u64,
    pub cache_write_failures: u64,
    pub average_duration_ms: f64,
    pub max_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub circuit_breaker: Vec<BreakerStats>,
    pub cache: CacheStats,
    pub performance: PerformanceStats,
    pub auth: Value,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: Url,
    pub cache_enabled: bool,
    pub default_cache_ttl: Duration,
    pub default_timeout: Duration,
}

/// Deterministic cache key: `cms:{METHOD}:{path}:{digest of the sorted query}`. Pairs are
/// ordered by name; repeated names keep their relative order.
pub fn cache_key(method: HttpMethod, path: &str, query: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> = query.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical = Value::Array(
        pairs
            .into_iter()
            .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), Value::String(v.clone())]))
            .collect(),
    );
    let digest = stable_digest(&canonical);
    format!("{}:{}:{}:{}", KEY_PREFIX, method.as_str(), path, &digest[..16])
}

pub struct RequestPipeline {
    logger: Logger,
    config: PipelineConfig,
    cache: Arc<dyn CacheStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    auth: Arc<AuthManager>,
    transport: Arc<dyn Transport>,
    metrics: PerformanceCounters,
}

impl RequestPipeline {
    pub fn new(
        config: PipelineConfig,
        cache: Arc<dyn CacheStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryExecutor,
        auth: Arc<AuthManager>,
        transport: Arc<dyn Transport>,
        logger: Logger,
    ) -> Self {
        Self {
            logger: logger.child("pipeline"),
            config,
            cache,
            breakers,
            retry,
            auth,
            transport,
            metrics: PerformanceCounters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn base_url(&self) -> &Url {
        &self.config.base_url
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> ResponseEnvelope {
        self.request(HttpMethod::Get, path, options).await
    }

    pub async fn post(&self, path: &str, options: RequestOptions) -> ResponseEnvelope {
        self.request(HttpMethod::Post, path, options).await
    }

    pub async fn put(&self, path: &str, options: RequestOptions) -> ResponseEnvelope {
        self.request(HttpMethod::Put, path, options).await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> ResponseEnvelope {
        self.request(HttpMethod::Delete, path, options).await
    }

    /// Runs one call end to end. Never panics and never returns a raw transport error.
    pub async fn request(&self, method: HttpMethod, path: &str, options: RequestOptions) -> ResponseEnvelope {
        let ctx = RequestContext::new(method, path, &options);
        self.logger.debug(
            "Request started",
            Some(&serde_json::json!({
                "request_id": ctx.request_id,
                "operation": ctx.operation,
                "resource": ctx.resource,
            })),
        );

        let (result, cached) = match AssertUnwindSafe(self.run(&ctx, options)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                (
                    Err(RequestError::unknown(format!("Request handler panicked: {}", message))),
                    false,
                )
            }
        };

        let duration_ms = ctx.elapsed_ms();
        self.metrics.record(result.is_ok(), duration_ms);
        let metadata = ResponseMetadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: ctx.request_id.clone(),
            duration_ms,
            cached,
        };

        match result {
            Ok(data) => {
                self.logger.info(
                    "Request completed",
                    Some(&serde_json::json!({
                        "request_id": ctx.request_id,
                        "operation": ctx.operation,
                        "duration_ms": duration_ms,
                        "cached": cached,
                    })),
                );
                ResponseEnvelope::ok(data, metadata)
            }
            Err(mut err) => {
                err.details = err.details.map(|d| redact_object(&d, MAX_DETAIL_STRING));
                self.logger.warn(
                    "Request failed",
                    Some(&serde_json::json!({
                        "request_id": ctx.request_id,
                        "operation": ctx.operation,
                        "code": err.code,
                        "message": err.message,
                        "duration_ms": duration_ms,
                    })),
                );
                ResponseEnvelope::err(err, metadata)
            }
        }
    }

    async fn run(&self, ctx: &RequestContext, options: RequestOptions) -> (Result<Value, RequestError>, bool) {
        let url = match self.build_url(&ctx.path, &options) {
            Ok(url) => url,
            Err(err) => return (Err(err), false),
        };

        let key = (ctx.method.is_read_only() && options.cache && self.config.cache_enabled)
            .then(|| self.key_for(ctx.method, &url));
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key).await {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return (Ok(hit), true);
            }
        }

        let result = self.execute_upstream(ctx, url, &options).await;

        match &result {
            Ok(value) => {
                if let Some(key) = &key {
                    let ttl = options.cache_ttl.unwrap_or(self.config.default_cache_ttl);
                    if let Err(err) = self.cache.set(key, value.clone(), ttl).await {
                        self.metrics
                            .cache_write_failures
                            .fetch_add(1, Ordering::Relaxed);
                        self.logger.warn(
                            "Cache write failed; returning upstream result",
                            Some(&serde_json::json!({
                                "request_id": ctx.request_id,
                                "error": err.message,
                            })),
                        );
                    }
                }
                if !ctx.method.is_read_only() {
                    for pattern in &options.invalidate {
                        let removed = self.cache.invalidate_pattern(pattern).await;
                        self.logger.debug(
                            "Cache invalidated",
                            Some(&serde_json::json!({
                                "request_id": ctx.request_id,
                                "pattern": pattern,
                                "removed": removed,
                            })),
                        );
                    }
                }
            }
            Err(err) => {
                if err.detail("circuit").is_some() {
                    self.metrics
                        .circuit_rejections
                        .fetch_add(1, Ordering::Relaxed);
                }
                if err.code == ErrorCode::AuthenticationError && self.auth.is_refreshable() {
                    self.auth.invalidate().await;
                }
            }
        }
        (result, false)
    }

    async fn execute_upstream(
        &self,
        ctx: &RequestContext,
        url: Url,
        options: &RequestOptions,
    ) -> Result<Value, RequestError> {
        let mut headers = self.auth.headers().await?;
        headers
            .entry("accept".to_string())
            .or_insert_with(|| "application/json".to_string());
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        let template = TransportRequest {
            method: ctx.method,
            url: url.clone(),
            headers,
            body: options.body.clone(),
            timeout: options.timeout.unwrap_or(self.config.default_timeout),
        };

        let executor = match options.retries {
            RetrySetting::Default => self.retry.clone(),
            RetrySetting::Disabled => self.retry.with_max_attempts(1),
            RetrySetting::Attempts(n) => self.retry.with_max_attempts(n),
        };
        let transport = &self.transport;
        let template = &template;
        let retry_logger = &self.logger;

        let with_retries = move || async move {
            executor
                .execute(
                    move |_attempt| async move {
                        let response = transport
                            .invoke(template.clone())
                            .await
                            .map_err(RequestError::from)?;
                        normalize_response(&response)
                    },
                    RetryOptions::default().on_retry(move |record| {
                        retry_logger.info(
                            "Retrying upstream call",
                            Some(&serde_json::json!({
                                "request_id": ctx.request_id,
                                "attempt": record.attempt,
                                "code": record.error.code,
                                "delay_ms": u64::try_from(record.next_delay.as_millis()).unwrap_or(u64::MAX),
                            })),
                        );
                    }),
                )
                .await
                .result
        };

        if options.circuit_breaker {
            let breaker = self.breakers.get(&target_for_url(&url));
            breaker.execute(with_retries).await
        } else {
            with_retries().await
        }
    }

    fn build_url(&self, path: &str, options: &RequestOptions) -> Result<Url, RequestError> {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path).map_err(|err| RequestError::validation(format!("Invalid URL: {}", err)))?
        } else {
            self.config
                .base_url
                .join(path)
                .map_err(|err| RequestError::validation(format!("Invalid path '{}': {}", path, err)))?
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::validation("Only http/https URLs are supported"));
        }
        // Params extend whatever query the path already carries.
        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        pairs.extend(options.query_pairs());
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            let encoded = serde_urlencoded::to_string(&pairs)
                .map_err(|err| RequestError::validation(format!("Invalid query parameters: {}", err)))?;
            url.set_query(Some(&encoded));
        }
        Ok(url)
    }

    /// Keys on the URL actually sent. Same-origin URLs key by path so operators can
    /// invalidate with `cms:GET:/content/*`.
    fn key_for(&self, method: HttpMethod, url: &Url) -> String {
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        if url.origin() == self.config.base_url.origin() {
            cache_key(method, url.path(), &query)
        } else {
            cache_key(method, &url[..url::Position::AfterPath], &query)
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            circuit_breaker: self.breakers.stats(),
            cache: self.cache.stats(),
            performance: self.metrics.snapshot(),
            auth: self.auth.stats(),
        }
    }

    /// Drops entries matching `pattern`, or everything. Returns how many were removed.
    pub async fn clear_cache(&self, pattern: Option<&str>) -> usize {
        let removed = match pattern {
            Some(pattern) => self.cache.invalidate_pattern(pattern).await,
            None => {
                let size = self.cache.stats().size;
                self.cache.clear().await;
                size
            }
        };
        self.logger.info(
            "Cache cleared",
            Some(&serde_json::json!({"pattern": pattern, "removed": removed})),
        );
        removed
    }

    pub fn reset_circuit_breaker(&self, target: Option<&str>) -> usize {
        self.breakers.reset(target)
    }
}
