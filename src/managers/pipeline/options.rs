use crate::services::transport::{HttpMethod, RequestBody};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrySetting {
    #[default]
    Default,
    Disabled,
    /// Total attempts, including the first.
    Attempts(u32),
}

/// Per-call knobs. Every field is independent; `RequestOptions::default()` means "cache reads,
/// retry with the configured policy, go through the circuit breaker".
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub cache: bool,
    pub cache_ttl: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: RetrySetting,
    pub circuit_breaker: bool,
    pub headers: HashMap<String, String>,
    /// Query parameters. Kept sorted so equal parameter sets build equal cache keys.
    pub params: BTreeMap<String, Value>,
    pub body: Option<RequestBody>,
    /// Cache patterns dropped after a successful mutating call.
    pub invalidate: Vec<String>,
    pub operation: Option<String>,
    pub resource: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache: true,
            cache_ttl: None,
            timeout: None,
            retries: RetrySetting::Default,
            circuit_breaker: true,
            headers: HashMap::new(),
            params: BTreeMap::new(),
            body: None,
            invalidate: Vec::new(),
            operation: None,
            resource: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: RetrySetting) -> Self {
        self.retries = retries;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = false;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn form<K: Into<String>, V: Into<String>>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        self.body = Some(RequestBody::Form(
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ));
        self
    }

    pub fn invalidate(mut self, pattern: impl Into<String>) -> Self {
        self.invalidate.push(pattern.into());
        self
    }

    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = Some(name.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Query pairs in key order. Arrays repeat the key; nulls are skipped.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (key, value) in &self.params {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        out.push((key.clone(), scalar_text(item)));
                    }
                }
                other => out.push((key.clone(), scalar_text(other))),
            }
        }
        out
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fresh per pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub request_id: String,
    pub operation: String,
    pub resource: String,
    pub method: HttpMethod,
    pub path: String,
    #[serde(skip)]
    pub started_at: Instant,
    pub started_at_wall: String,
}

impl RequestContext {
    pub fn new(method: HttpMethod, path: &str, options: &RequestOptions) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            operation: options
                .operation
                .clone()
                .unwrap_or_else(|| format!("{} {}", method.as_str(), path)),
            resource: options.resource.clone().unwrap_or_else(|| path.to_string()),
            method,
            path: path.to_string(),
            started_at: Instant::now(),
            started_at_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
