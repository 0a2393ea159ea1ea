use crate::config::{AuthKind, CacheBackend, Settings};
use crate::errors::RequestError;
use crate::managers::pipeline::{PipelineConfig, RequestPipeline};
use crate::services::auth::{AuthManager, AuthMode, OAuthTokenProvider};
use crate::services::cache::{CacheStore, MemoryCache};
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::file_cache::FileCache;
use crate::services::logger::Logger;
use crate::services::retry::RetryExecutor;
use crate::services::transport::{ReqwestTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Wires the shared components. Nothing here is global; every piece is handed to the
/// pipeline by `Arc`.
pub struct App {
    pub logger: Logger,
    pub settings: Settings,
    pub pipeline: Arc<RequestPipeline>,
    cleanup: Option<JoinHandle<()>>,
}

impl App {
    pub fn initialize() -> Result<Self, RequestError> {
        Self::from_settings(Settings::from_env()?)
    }

    pub fn from_settings(settings: Settings) -> Result<Self, RequestError> {
        let logger = Logger::new("cms");
        let transport = Arc::new(ReqwestTransport::new(
            settings.transport.to_config(),
            logger.clone(),
        )?);
        Self::build(settings, transport, logger)
    }

    /// Same wiring over a caller-supplied transport.
    pub fn with_transport(settings: Settings, transport: Arc<dyn Transport>) -> Result<Self, RequestError> {
        Self::build(settings, transport, Logger::new("cms"))
    }

    fn build(settings: Settings, transport: Arc<dyn Transport>, logger: Logger) -> Result<Self, RequestError> {
        settings.validate()?;
        let base_url = settings.base_url()?;

        let cleanup_every = (settings.cache.cleanup_interval_ms > 0
            && tokio::runtime::Handle::try_current().is_ok())
        .then(|| Duration::from_millis(settings.cache.cleanup_interval_ms));
        let mut cleanup = None;
        let cache: Arc<dyn CacheStore> = match settings.cache.backend {
            CacheBackend::Memory => {
                let memory = Arc::new(MemoryCache::<serde_json::Value>::new(
                    logger.clone(),
                    settings.cache.max_entries,
                    settings.cache.strategy,
                ));
                cleanup = cleanup_every.map(|every| memory.spawn_cleanup(every));
                memory
            }
            CacheBackend::File => {
                let file = Arc::new(FileCache::new(
                    logger.clone(),
                    settings.cache.resolved_dir(),
                    settings.cache.max_entries,
                    settings.cache.strategy,
                    settings.cache.on_set_failure,
                ));
                cleanup = cleanup_every.map(|every| file.spawn_cleanup(every));
                file
            }
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            settings.breaker.to_config(),
            logger.clone(),
        ));
        let retry = RetryExecutor::new(settings.retry.to_config()?, logger.clone());
        let auth = Arc::new(AuthManager::new(
            Self::auth_mode(&settings, transport.clone())?,
            logger.clone(),
        ));

        let pipeline = Arc::new(RequestPipeline::new(
            PipelineConfig {
                base_url,
                cache_enabled: settings.cache.enabled,
                default_cache_ttl: Duration::from_millis(settings.cache.default_ttl_ms),
                default_timeout: Duration::from_millis(settings.transport.request_timeout_ms),
            },
            cache,
            breakers,
            retry,
            auth,
            transport,
            logger.clone(),
        ));

        logger.info(
            "Request core initialized",
            Some(&serde_json::json!({
                "base_url": settings.base_url,
                "cache_backend": settings.cache.backend,
                "auth": settings.auth.mode,
            })),
        );

        Ok(Self {
            logger,
            settings,
            pipeline,
            cleanup,
        })
    }

    fn auth_mode(settings: &Settings, transport: Arc<dyn Transport>) -> Result<AuthMode, RequestError> {
        let auth = &settings.auth;
        Ok(match auth.mode {
            AuthKind::None => AuthMode::None,
            AuthKind::Basic => AuthMode::Basic {
                username: auth.username.clone().unwrap_or_default(),
                password: auth.password.clone().unwrap_or_default(),
            },
            AuthKind::Bearer => AuthMode::Bearer {
                token: auth.token.clone().unwrap_or_default(),
            },
            AuthKind::Oauth => {
                let oauth = auth
                    .oauth
                    .clone()
                    .ok_or_else(|| RequestError::validation("oauth auth requires an oauth block"))?;
                AuthMode::Token {
                    provider: Arc::new(OAuthTokenProvider::new(
                        oauth,
                        transport,
                        Duration::from_millis(settings.transport.request_timeout_ms),
                    )),
                }
            }
        })
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}
