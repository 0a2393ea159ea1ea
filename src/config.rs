use crate::constants::{breaker, cache, network};
use crate::errors::{ErrorCode, RequestError};
use crate::services::auth::{GrantType, OAuthConfig};
use crate::services::cache::EvictionStrategy;
use crate::services::circuit_breaker::BreakerConfig;
use crate::services::file_cache::SetFailureMode;
use crate::services::retry::RetryConfig;
use crate::services::transport::TransportConfig;
use crate::utils::feature_flags::{env_first, env_flag, env_parse, is_truthy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: CacheBackend,
    pub max_entries: usize,
    pub default_ttl_ms: u64,
    pub strategy: EvictionStrategy,
    /// 0 disables the background sweep.
    pub cleanup_interval_ms: u64,
    pub dir: Option<PathBuf>,
    pub on_set_failure: SetFailureMode,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            max_entries: cache::MAX_ENTRIES,
            default_ttl_ms: cache::DEFAULT_TTL_MS,
            strategy: EvictionStrategy::Lru,
            cleanup_interval_ms: cache::CLEANUP_INTERVAL_MS,
            dir: None,
            on_set_failure: SetFailureMode::Ignore,
        }
    }
}

impl CacheSettings {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cms-bridge-cache"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub monitoring_period_ms: u64,
    pub expected_codes: Vec<ErrorCode>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: breaker::FAILURE_THRESHOLD,
            recovery_timeout_ms: breaker::RECOVERY_TIMEOUT_MS,
            monitoring_period_ms: breaker::MONITORING_PERIOD_MS,
            expected_codes: vec![
                ErrorCode::NetworkError,
                ErrorCode::TimeoutError,
                ErrorCode::ServerError,
            ],
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            monitoring_period: Duration::from_millis(self.monitoring_period_ms),
            expected_codes: self.expected_codes.iter().copied().collect(),
        }
    }
}

/// Retry policy: a named preset with optional per-field overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub preset: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub attempt_timeout_ms: Option<u64>,
    pub respect_retry_after: Option<bool>,
    pub retryable_codes: Option<Vec<ErrorCode>>,
}

impl RetrySettings {
    pub fn to_config(&self) -> Result<RetryConfig, RequestError> {
        let mut config = match self.preset.as_deref() {
            Some(name) => RetryConfig::preset(name).ok_or_else(|| {
                RequestError::validation(format!("Unknown retry preset: {}", name))
            })?,
            None => RetryConfig::http(),
        };
        if let Some(n) = self.max_attempts {
            config = config.with_max_attempts(n);
        }
        if let Some(ms) = self.base_delay_ms {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = self.backoff_multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(RequestError::validation(
                    "retry.backoff_multiplier must be a finite number >= 1",
                ));
            }
            config.backoff_multiplier = multiplier;
        }
        if let Some(ms) = self.attempt_timeout_ms {
            config.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(respect) = self.respect_retry_after {
            config.respect_retry_after = respect;
        }
        if let Some(codes) = &self.retryable_codes {
            config.retryable_codes = codes.iter().copied().collect();
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pool_idle_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
    pub max_in_flight: usize,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: network::TIMEOUT_REQUEST_MS,
            connect_timeout_ms: network::TIMEOUT_CONNECT_MS,
            pool_idle_timeout_ms: network::POOL_IDLE_TIMEOUT_MS,
            pool_max_idle_per_host: network::POOL_MAX_IDLE_PER_HOST,
            max_in_flight: network::MAX_IN_FLIGHT,
            user_agent: network::USER_AGENT.to_string(),
            accept_invalid_certs: false,
        }
    }
}

impl TransportSettings {
    pub fn to_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            pool_idle_timeout: Duration::from_millis(self.pool_idle_timeout_ms),
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            max_in_flight: self.max_in_flight.max(1),
            tcp_keepalive: Duration::from_millis(network::TCP_KEEPALIVE_MS),
            user_agent: self.user_agent.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    None,
    Basic,
    Bearer,
    Oauth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub mode: AuthKind,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub oauth: Option<OAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub cache: CacheSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub transport: TransportSettings,
    pub auth: AuthSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4502".to_string(),
            cache: CacheSettings::default(),
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            transport: TransportSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

fn invalid(message: impl Into<String>) -> RequestError {
    RequestError::validation(message).with_detail("source", Value::String("config".to_string()))
}

impl Settings {
    /// Reads `CMS_*` variables over the built-in defaults.
    pub fn from_env() -> Result<Self, RequestError> {
        let mut settings = Settings::default();

        if let Some(url) = env_first(&["CMS_BASE_URL", "CMS_HOST"]) {
            settings.base_url = url;
        }

        let cache = &mut settings.cache;
        if let Some(enabled) = env_flag(&["CMS_CACHE_ENABLED"]) {
            cache.enabled = enabled;
        }
        if let Some(raw) = env_first(&["CMS_CACHE_BACKEND"]) {
            cache.backend = match raw.to_lowercase().as_str() {
                "memory" => CacheBackend::Memory,
                "file" | "disk" => CacheBackend::File,
                other => return Err(invalid(format!("Unknown CMS_CACHE_BACKEND: {}", other))),
            };
        }
        if let Some(n) = env_parse(&["CMS_CACHE_MAX_ENTRIES"]) {
            cache.max_entries = n;
        }
        if let Some(ms) = env_parse(&["CMS_CACHE_TTL_MS"]) {
            cache.default_ttl_ms = ms;
        }
        if let Some(raw) = env_first(&["CMS_CACHE_STRATEGY"]) {
            cache.strategy = EvictionStrategy::parse(&raw)
                .ok_or_else(|| invalid(format!("Unknown CMS_CACHE_STRATEGY: {}", raw)))?;
        }
        if let Some(ms) = env_parse(&["CMS_CACHE_CLEANUP_INTERVAL_MS"]) {
            cache.cleanup_interval_ms = ms;
        }
        if let Some(dir) = env_first(&["CMS_CACHE_DIR"]) {
            cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = env_first(&["CMS_CACHE_SET_FAILURE"]) {
            cache.on_set_failure = if raw.eq_ignore_ascii_case("propagate") || is_truthy(&raw) {
                SetFailureMode::Propagate
            } else {
                SetFailureMode::Ignore
            };
        }

        let breaker = &mut settings.breaker;
        if let Some(n) = env_parse(&["CMS_BREAKER_THRESHOLD"]) {
            breaker.failure_threshold = n;
        }
        if let Some(ms) = env_parse(&["CMS_BREAKER_RECOVERY_MS"]) {
            breaker.recovery_timeout_ms = ms;
        }
        if let Some(ms) = env_parse(&["CMS_BREAKER_MONITORING_MS"]) {
            breaker.monitoring_period_ms = ms;
        }

        let retry = &mut settings.retry;
        retry.preset = env_first(&["CMS_RETRY_PRESET"]);
        retry.max_attempts = env_parse(&["CMS_RETRY_ATTEMPTS"]);
        retry.base_delay_ms = env_parse(&["CMS_RETRY_BASE_DELAY_MS"]);
        retry.max_delay_ms = env_parse(&["CMS_RETRY_MAX_DELAY_MS"]);
        retry.backoff_multiplier = env_parse(&["CMS_RETRY_MULTIPLIER"]);
        retry.attempt_timeout_ms = env_parse(&["CMS_RETRY_ATTEMPT_TIMEOUT_MS"]);
        retry.respect_retry_after = env_flag(&["CMS_RETRY_RESPECT_RETRY_AFTER"]);

        let transport = &mut settings.transport;
        if let Some(ms) = env_parse(&["CMS_TIMEOUT_MS"]) {
            transport.request_timeout_ms = ms;
        }
        if let Some(ms) = env_parse(&["CMS_CONNECT_TIMEOUT_MS"]) {
            transport.connect_timeout_ms = ms;
        }
        if let Some(n) = env_parse(&["CMS_POOL_MAX_IDLE"]) {
            transport.pool_max_idle_per_host = n;
        }
        if let Some(n) = env_parse(&["CMS_MAX_IN_FLIGHT"]) {
            transport.max_in_flight = n;
        }
        if let Some(insecure) = env_flag(&["CMS_INSECURE_TLS"]) {
            transport.accept_invalid_certs = insecure;
        }

        settings.auth = Self::auth_from_env()?;
        settings.validate()?;
        Ok(settings)
    }

    fn auth_from_env() -> Result<AuthSettings, RequestError> {
        let mut auth = AuthSettings {
            username: env_first(&["CMS_USERNAME"]),
            password: env_first(&["CMS_PASSWORD"]),
            token: env_first(&["CMS_TOKEN", "CMS_ACCESS_TOKEN"]),
            ..AuthSettings::default()
        };
        if let Some(token_url) = env_first(&["CMS_OAUTH_TOKEN_URL"]) {
            let grant_type = match env_first(&["CMS_OAUTH_GRANT_TYPE"]).as_deref() {
                None | Some("client_credentials") => GrantType::ClientCredentials,
                Some("refresh_token") => GrantType::RefreshToken,
                Some(other) => {
                    return Err(invalid(format!("Unknown CMS_OAUTH_GRANT_TYPE: {}", other)))
                }
            };
            auth.oauth = Some(OAuthConfig {
                token_url,
                client_id: env_first(&["CMS_OAUTH_CLIENT_ID"]).unwrap_or_default(),
                client_secret: env_first(&["CMS_OAUTH_CLIENT_SECRET"]).unwrap_or_default(),
                grant_type,
                refresh_token: env_first(&["CMS_OAUTH_REFRESH_TOKEN"]),
                scope: env_first(&["CMS_OAUTH_SCOPE"]),
                audience: env_first(&["CMS_OAUTH_AUDIENCE"]),
                token_path: env_first(&["CMS_OAUTH_TOKEN_PATH"])
                    .unwrap_or_else(|| "access_token".to_string()),
                expiry_buffer_ms: env_parse(&["CMS_OAUTH_EXPIRY_BUFFER_MS"])
                    .unwrap_or(crate::constants::auth::EXPIRY_BUFFER_MS),
            });
        }

        auth.mode = match env_first(&["CMS_AUTH_MODE"]) {
            Some(raw) => match raw.to_lowercase().as_str() {
                "none" => AuthKind::None,
                "basic" => AuthKind::Basic,
                "bearer" | "token" => AuthKind::Bearer,
                "oauth" | "oauth2" => AuthKind::Oauth,
                other => return Err(invalid(format!("Unknown CMS_AUTH_MODE: {}", other))),
            },
            None if auth.oauth.is_some() => AuthKind::Oauth,
            None if auth.token.is_some() => AuthKind::Bearer,
            None if auth.username.is_some() && auth.password.is_some() => AuthKind::Basic,
            None => AuthKind::None,
        };
        Ok(auth)
    }

    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let settings: Settings = serde_json::from_value(value)
            .map_err(|err| invalid(format!("Invalid settings: {}", err)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn base_url(&self) -> Result<Url, RequestError> {
        let url = Url::parse(&self.base_url)
            .map_err(|err| invalid(format!("Invalid base_url '{}': {}", self.base_url, err)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("base_url must use http or https"));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        self.base_url()?;
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        self.retry.to_config()?;
        match self.auth.mode {
            AuthKind::None => {}
            AuthKind::Basic => {
                if self.auth.username.is_none() || self.auth.password.is_none() {
                    return Err(invalid("basic auth requires username and password"));
                }
            }
            AuthKind::Bearer => {
                if self.auth.token.is_none() {
                    return Err(invalid("bearer auth requires a token"));
                }
            }
            AuthKind::Oauth => {
                let Some(oauth) = &self.auth.oauth else {
                    return Err(invalid("oauth auth requires an oauth block"));
                };
                if oauth.client_id.is_empty() || oauth.client_secret.is_empty() {
                    return Err(invalid("oauth requires client_id and client_secret"));
                }
            }
        }
        Ok(())
    }
}
