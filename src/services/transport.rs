use crate::constants::network;
use crate::errors::TransportError;
use crate::services::logger::Logger;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "HEAD" => Some(HttpMethod::Head),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head)
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    /// `application/x-www-form-urlencoded`; the usual shape for CMS servlet posts.
    Form(Vec<(String, String)>),
    Raw { bytes: Bytes, content_type: String },
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub body: Option<RequestBody>,
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HashMap::new(),
            body: None,
            timeout: Duration::from_millis(network::TIMEOUT_REQUEST_MS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub max_in_flight: usize,
    pub tcp_keepalive: Duration,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(network::TIMEOUT_CONNECT_MS),
            request_timeout: Duration::from_millis(network::TIMEOUT_REQUEST_MS),
            pool_idle_timeout: Duration::from_millis(network::POOL_IDLE_TIMEOUT_MS),
            pool_max_idle_per_host: network::POOL_MAX_IDLE_PER_HOST,
            max_in_flight: network::MAX_IN_FLIGHT,
            tcp_keepalive: Duration::from_millis(network::TCP_KEEPALIVE_MS),
            user_agent: network::USER_AGENT.to_string(),
            accept_invalid_certs: false,
        }
    }
}

/// One pooled `reqwest::Client` shared by every call, with a cap on concurrent requests.
pub struct ReqwestTransport {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    config: TransportConfig,
    logger: Logger,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig, logger: Logger) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_idle_timeout(Some(config.pool_idle_timeout))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_keepalive(Some(config.tcp_keepalive))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|err| TransportError::InvalidRequest(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
            logger: logger.child("transport"),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight.max(1) - self.permits.available_permits()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn invoke(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Other("transport is shut down".to_string()))?;

        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
        let mut builder = self
            .client
            .request(request.method.to_reqwest(), request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Form(pairs)) => builder.form(&pairs),
            Some(RequestBody::Raw { bytes, content_type }) => builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes),
            None => builder,
        };

        self.logger.debug(
            "HTTP request",
            Some(&serde_json::json!({
                "method": request.method.as_str(),
                "url": request.url.as_str(),
                "timeout_ms": timeout_ms,
            })),
        );

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::from_reqwest(err, timeout_ms))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(err, timeout_ms))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
