#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cms_bridge::services::transport::{Transport, TransportRequest, TransportResponse};
use cms_bridge::{App, Settings, TransportError};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

pub static ENV_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

#[derive(Clone, Debug)]
pub enum Step {
    Reply {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: String,
    },
    Fail(TransportError),
    Panic(&'static str),
}

pub fn reply(status: u16, body: Value) -> Step {
    Step::Reply {
        status,
        headers: vec![("content-type", "application/json")],
        body: body.to_string(),
    }
}

pub fn reply_with_headers(status: u16, headers: Vec<(&'static str, &'static str)>, body: Value) -> Step {
    Step::Reply {
        status,
        headers,
        body: body.to_string(),
    }
}

/// In-memory upstream. Steps are consumed in order; the last one repeats. Requests whose
/// path ends in `/token` are answered by a built-in token endpoint issuing `tok-1`, `tok-2`...
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<TransportRequest>>,
    tokens_issued: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            tokens_issued: AtomicUsize::new(0),
        })
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::new(vec![step])
    }

    /// Upstream calls seen so far, token requests excluded.
    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn tokens_issued(&self) -> usize {
        self.tokens_issued.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().expect("steps lock");
        if steps.len() > 1 {
            steps.pop_front().expect("non-empty")
        } else {
            steps.front().cloned().unwrap_or_else(|| reply(200, Value::Null))
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn invoke(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        if request.url.path().ends_with("/token") {
            let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(TransportResponse {
                status: 200,
                headers: HashMap::new(),
                body: Bytes::from(
                    serde_json::json!({"access_token": format!("tok-{}", n), "expires_in": 3600})
                        .to_string(),
                ),
            });
        }

        self.requests.lock().expect("requests lock").push(request);
        match self.next_step() {
            Step::Reply {
                status,
                headers,
                body,
            } => Ok(TransportResponse {
                status,
                headers: headers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: Bytes::from(body),
            }),
            Step::Fail(err) => Err(err),
            Step::Panic(message) => panic!("{}", message),
        }
    }
}

/// Settings tuned for tests: no background sweep, quick breaker, default retry policy.
pub fn test_settings(overrides: Value) -> Settings {
    let mut base = serde_json::json!({
        "base_url": "http://author.test:4502",
        "cache": {"cleanup_interval_ms": 0},
    });
    merge(&mut base, overrides);
    Settings::from_value(base).expect("test settings")
}

pub fn app_with(transport: Arc<ScriptedTransport>, overrides: Value) -> App {
    App::with_transport(test_settings(overrides), transport).expect("app")
}

fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}
