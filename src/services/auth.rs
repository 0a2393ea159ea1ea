use crate::constants::auth as defaults;
use crate::errors::{ErrorCode, RequestError};
use crate::services::logger::Logger;
use crate::services::transport::{HttpMethod, RequestBody, Transport, TransportRequest};
use crate::utils::redact::{redact_object, redact_text};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

/// Replaced wholesale on refresh. `expires_at: None` never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: Option<Instant>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, lifetime: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: lifetime.map(|ttl| Instant::now() + ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<AuthToken, RequestError>;

    fn name(&self) -> &str {
        "custom"
    }
}

pub struct StaticTokenProvider {
    token: String,
    lifetime: Option<Duration>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>, lifetime: Option<Duration>) -> Self {
        Self {
            token: token.into(),
            lifetime,
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<AuthToken, RequestError> {
        Ok(AuthToken::new(self.token.clone(), self.lifetime))
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    #[default]
    ClientCredentials,
    RefreshToken,
}

impl GrantType {
    fn as_str(self) -> &'static str {
        match self {
            GrantType::ClientCredentials => "client_credentials",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub grant_type: GrantType,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// Dotted path to the token inside the token endpoint's JSON reply.
    #[serde(default = "default_token_path")]
    pub token_path: String,
    #[serde(default = "default_expiry_buffer_ms")]
    pub expiry_buffer_ms: u64,
}

fn default_token_path() -> String {
    "access_token".to_string()
}

fn default_expiry_buffer_ms() -> u64 {
    defaults::EXPIRY_BUFFER_MS
}

pub struct OAuthTokenProvider {
    config: OAuthConfig,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl OAuthTokenProvider {
    pub fn new(config: OAuthConfig, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            config,
            transport,
            timeout,
        }
    }

    fn form(&self) -> Result<Vec<(String, String)>, RequestError> {
        let mut form = vec![
            ("grant_type".to_string(), self.config.grant_type.as_str().to_string()),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("client_secret".to_string(), self.config.client_secret.clone()),
        ];
        if let Some(scope) = &self.config.scope {
            form.push(("scope".to_string(), scope.clone()));
        }
        if let Some(audience) = &self.config.audience {
            form.push(("audience".to_string(), audience.clone()));
        }
        if self.config.grant_type == GrantType::RefreshToken {
            let refresh = self.config.refresh_token.as_ref().ok_or_else(|| {
                RequestError::authentication("refresh_token grant requires a refresh token")
            })?;
            form.push(("refresh_token".to_string(), refresh.clone()));
        }
        Ok(form)
    }

    fn token_at_path<'a>(payload: &'a Value, path: &str) -> Option<&'a str> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(payload, |current, segment| match current {
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                other => other.get(segment),
            })
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn fetch_token(&self) -> Result<AuthToken, RequestError> {
        let url = Url::parse(&self.config.token_url).map_err(|err| {
            RequestError::authentication(format!("Invalid token_url: {}", err))
        })?;
        let mut request = TransportRequest::new(HttpMethod::Post, url);
        request.timeout = self.timeout;
        request
            .headers
            .insert("accept".to_string(), "application/json".to_string());
        request.body = Some(RequestBody::Form(self.form()?));

        let response = self
            .transport
            .invoke(request)
            .await
            .map_err(|err| RequestError::from(err).with_retryable(true))?;

        if !response.is_success() {
            return Err(RequestError::authentication(format!(
                "Token request failed ({})",
                response.status
            ))
            .with_retryable(response.status >= 500)
            .with_details(serde_json::json!({
                "status": response.status,
                "body": match response.json() {
                    Some(body) => redact_object(&body, 2048),
                    None => Value::String(redact_text(&response.text(), 2048)),
                },
            })));
        }

        let payload = response
            .json()
            .ok_or_else(|| RequestError::authentication("Token response is not JSON"))?;
        let token = Self::token_at_path(&payload, &self.config.token_path).ok_or_else(|| {
            RequestError::authentication(format!(
                "Token not found at '{}' in token response",
                self.config.token_path
            ))
        })?;

        let buffer = self.config.expiry_buffer_ms;
        let lifetime_ms = payload
            .get("expires_in")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(defaults::DEFAULT_TOKEN_TTL_MS);
        Ok(AuthToken::new(
            token,
            Some(Duration::from_millis(lifetime_ms.saturating_sub(buffer))),
        ))
    }

    fn name(&self) -> &str {
        "oauth2"
    }
}

pub enum AuthMode {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    Token { provider: Arc<dyn TokenProvider> },
}

impl AuthMode {
    fn label(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Basic { .. } => "basic",
            AuthMode::Bearer { .. } => "bearer",
            AuthMode::Token { .. } => "token",
        }
    }
}

pub struct AuthManager {
    mode: AuthMode,
    token: Mutex<Option<AuthToken>>,
    refreshes: AtomicU64,
    logger: Logger,
}

impl AuthManager {
    pub fn new(mode: AuthMode, logger: Logger) -> Self {
        Self {
            mode,
            token: Mutex::new(None),
            refreshes: AtomicU64::new(0),
            logger: logger.child("auth"),
        }
    }

    pub fn none(logger: Logger) -> Self {
        Self::new(AuthMode::None, logger)
    }

    /// Headers for one outgoing request, refreshing the token first when needed.
    ///
    /// The token lock is held across the refresh, so concurrent callers wait for the
    /// refresh already in progress instead of starting their own.
    pub async fn headers(&self) -> Result<HashMap<String, String>, RequestError> {
        let mut headers = HashMap::new();
        match &self.mode {
            AuthMode::None => {}
            AuthMode::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                headers.insert("authorization".to_string(), format!("Basic {}", encoded));
            }
            AuthMode::Bearer { token } => {
                headers.insert("authorization".to_string(), format!("Bearer {}", token));
            }
            AuthMode::Token { provider } => {
                let mut guard = self.token.lock().await;
                let current = match guard.as_ref() {
                    Some(token) if !token.is_expired() => token.value.clone(),
                    _ => {
                        let fresh = self.refresh(provider.as_ref()).await?;
                        let value = fresh.value.clone();
                        *guard = Some(fresh);
                        value
                    }
                };
                headers.insert("authorization".to_string(), format!("Bearer {}", current));
            }
        }
        Ok(headers)
    }

    async fn refresh(&self, provider: &dyn TokenProvider) -> Result<AuthToken, RequestError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.logger.debug(
            "Refreshing auth token",
            Some(&serde_json::json!({"provider": provider.name()})),
        );
        match provider.fetch_token().await {
            Ok(token) => Ok(token),
            Err(err) => {
                self.logger.warn(
                    "Token refresh failed",
                    Some(&serde_json::json!({
                        "provider": provider.name(),
                        "code": err.code,
                        "message": err.message,
                    })),
                );
                let retryable = err.retryable.unwrap_or(false);
                let mut mapped = if err.code == ErrorCode::AuthenticationError {
                    err
                } else {
                    let cause = err.code;
                    let mut wrapped = RequestError::authentication(format!(
                        "Token refresh failed: {}",
                        err.message
                    ));
                    wrapped.details = err.details;
                    wrapped.with_detail("cause", serde_json::json!(cause))
                };
                mapped.retryable = Some(retryable);
                Err(mapped)
            }
        }
    }

    /// Drops the current token so the next request refreshes it.
    pub async fn invalidate(&self) {
        if matches!(self.mode, AuthMode::Token { .. }) {
            let mut guard = self.token.lock().await;
            if guard.take().is_some() {
                self.logger.info("Auth token invalidated", None);
            }
        }
    }

    pub fn is_refreshable(&self) -> bool {
        matches!(self.mode, AuthMode::Token { .. })
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Value {
        let token_state = match self.token.try_lock() {
            Ok(guard) => match guard.as_ref() {
                None => "no_token",
                Some(token) if token.is_expired() => "expired",
                Some(_) => "valid",
            },
            Err(_) => "refreshing",
        };
        serde_json::json!({
            "mode": self.mode.label(),
            "token": if self.is_refreshable() { token_state } else { "static" },
            "refreshes": self.refresh_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::services::logger::LogLevel;
    use crate::services::transport::TransportResponse;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn quiet() -> Logger {
        Logger::new("test").with_level(LogLevel::Error)
    }

    struct CountingProvider {
        calls: AtomicUsize,
        lifetime: Duration,
        fail: bool,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn fetch_token(&self) -> Result<AuthToken, RequestError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(RequestError::network("idp unreachable"));
            }
            Ok(AuthToken::new(format!("tok-{}", n), Some(self.lifetime)))
        }
    }

    fn counting(lifetime: Duration, fail: bool) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime,
            fail,
        })
    }

    #[tokio::test]
    async fn basic_and_bearer_headers() {
        let basic = AuthManager::new(
            AuthMode::Basic {
                username: "admin".into(),
                password: "admin".into(),
            },
            quiet(),
        );
        assert_eq!(
            basic.headers().await.expect("headers")["authorization"],
            "Basic YWRtaW46YWRtaW4="
        );
        let bearer = AuthManager::new(AuthMode::Bearer { token: "abc".into() }, quiet());
        assert_eq!(
            bearer.headers().await.expect("headers")["authorization"],
            "Bearer abc"
        );
        assert!(AuthManager::none(quiet()).headers().await.expect("headers").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let provider = counting(Duration::from_secs(60), false);
        let auth = Arc::new(AuthManager::new(
            AuthMode::Token {
                provider: provider.clone(),
            },
            quiet(),
        ));
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.headers().await })
            })
            .collect();
        for task in tasks {
            let headers = task.await.expect("join").expect("headers");
            assert_eq!(headers["authorization"], "Bearer tok-1");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_or_invalidated_tokens_are_refreshed() {
        let provider = counting(Duration::from_secs(60), false);
        let auth = AuthManager::new(
            AuthMode::Token {
                provider: provider.clone(),
            },
            quiet(),
        );
        assert_eq!(auth.headers().await.expect("h")["authorization"], "Bearer tok-1");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(auth.headers().await.expect("h")["authorization"], "Bearer tok-2");
        auth.invalidate().await;
        assert_eq!(auth.stats()["token"], "no_token");
        assert_eq!(auth.headers().await.expect("h")["authorization"], "Bearer tok-3");
        assert_eq!(auth.refresh_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_is_authentication_error() {
        let auth = AuthManager::new(
            AuthMode::Token {
                provider: counting(Duration::from_secs(60), true),
            },
            quiet(),
        );
        let err = auth.headers().await.expect_err("refresh fails");
        assert_eq!(err.code, ErrorCode::AuthenticationError);
        assert_eq!(err.retryable, Some(false));
        assert_eq!(err.detail("cause"), Some(&serde_json::json!("NETWORK_ERROR")));
    }

    struct TokenEndpoint {
        status: u16,
        body: &'static str,
        seen_form: std::sync::Mutex<Option<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Transport for TokenEndpoint {
        async fn invoke(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            if let Some(RequestBody::Form(pairs)) = request.body {
                *self.seen_form.lock().expect("lock") = Some(pairs);
            }
            Ok(TransportResponse {
                status: self.status,
                headers: HashMap::new(),
                body: Bytes::from_static(self.body.as_bytes()),
            })
        }
    }

    fn oauth_config(grant_type: GrantType) -> OAuthConfig {
        OAuthConfig {
            token_url: "https://ims.example.com/ims/token/v3".into(),
            client_id: "cms-client".into(),
            client_secret: "s3cr3t".into(),
            grant_type,
            refresh_token: Some("rt-1".into()),
            scope: Some("content".into()),
            audience: None,
            token_path: default_token_path(),
            expiry_buffer_ms: 30_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oauth_provider_posts_form_and_applies_expiry_buffer() {
        let endpoint = Arc::new(TokenEndpoint {
            status: 200,
            body: r#"{"access_token":"at-9","expires_in":90}"#,
            seen_form: std::sync::Mutex::new(None),
        });
        let provider = OAuthTokenProvider::new(
            oauth_config(GrantType::RefreshToken),
            endpoint.clone(),
            Duration::from_secs(5),
        );
        let token = provider.fetch_token().await.expect("token");
        assert_eq!(token.value, "at-9");
        assert_eq!(token.expires_at, Some(Instant::now() + Duration::from_secs(60)));

        let form = endpoint.seen_form.lock().expect("lock").clone().expect("form sent");
        assert!(form.contains(&("grant_type".to_string(), "refresh_token".to_string())));
        assert!(form.contains(&("refresh_token".to_string(), "rt-1".to_string())));
    }

    #[tokio::test]
    async fn oauth_provider_reports_rejections() {
        let endpoint = Arc::new(TokenEndpoint {
            status: 401,
            body: r#"{"error":"invalid_client","client_secret":"s3cr3t"}"#,
            seen_form: std::sync::Mutex::new(None),
        });
        let provider = OAuthTokenProvider::new(
            oauth_config(GrantType::ClientCredentials),
            endpoint,
            Duration::from_secs(5),
        );
        let err = provider.fetch_token().await.expect_err("rejected");
        assert_eq!(err.code, ErrorCode::AuthenticationError);
        assert_eq!(err.retryable, Some(false));
        let body = err.detail("body").map(|v| v.to_string()).unwrap_or_default();
        assert!(body.contains("invalid_client"));
        assert!(!body.contains("s3cr3t"));
    }

    #[test]
    fn token_path_walks_nested_objects() {
        let payload = serde_json::json!({"data": {"tokens": [{"value": "x"}]}});
        assert_eq!(
            OAuthTokenProvider::token_at_path(&payload, "data.tokens.0.value"),
            Some("x")
        );
        assert_eq!(OAuthTokenProvider::token_at_path(&payload, "data.missing"), None);
    }
}
