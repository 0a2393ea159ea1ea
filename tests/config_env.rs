use cms_bridge::config::{AuthKind, CacheBackend};
use cms_bridge::services::cache::EvictionStrategy;
use cms_bridge::services::file_cache::SetFailureMode;
use cms_bridge::{App, ErrorCode, Settings};

mod common;
use common::ENV_LOCK;

const VARS: &[&str] = &[
    "CMS_BASE_URL",
    "CMS_HOST",
    "CMS_CACHE_ENABLED",
    "CMS_CACHE_BACKEND",
    "CMS_CACHE_MAX_ENTRIES",
    "CMS_CACHE_STRATEGY",
    "CMS_CACHE_DIR",
    "CMS_CACHE_SET_FAILURE",
    "CMS_CACHE_CLEANUP_INTERVAL_MS",
    "CMS_BREAKER_THRESHOLD",
    "CMS_RETRY_PRESET",
    "CMS_RETRY_ATTEMPTS",
    "CMS_MAX_IN_FLIGHT",
    "CMS_AUTH_MODE",
    "CMS_USERNAME",
    "CMS_PASSWORD",
    "CMS_TOKEN",
    "CMS_ACCESS_TOKEN",
    "CMS_OAUTH_TOKEN_URL",
    "CMS_OAUTH_CLIENT_ID",
    "CMS_OAUTH_CLIENT_SECRET",
];

struct EnvSnapshot(Vec<(&'static str, Option<String>)>);

impl EnvSnapshot {
    fn take() -> Self {
        let saved = VARS.iter().map(|k| (*k, std::env::var(k).ok())).collect();
        for key in VARS {
            std::env::remove_var(key);
        }
        Self(saved)
    }
}

impl Drop for EnvSnapshot {
    fn drop(&mut self) {
        for (key, value) in &self.0 {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

#[tokio::test]
async fn settings_read_cms_environment() {
    let _guard = ENV_LOCK.lock().await;
    let _env = EnvSnapshot::take();

    std::env::set_var("CMS_BASE_URL", "https://author.example.com");
    std::env::set_var("CMS_CACHE_BACKEND", "file");
    std::env::set_var("CMS_CACHE_DIR", "/tmp/cms-bridge-test-cache");
    std::env::set_var("CMS_CACHE_STRATEGY", "lfu");
    std::env::set_var("CMS_CACHE_SET_FAILURE", "propagate");
    std::env::set_var("CMS_BREAKER_THRESHOLD", "3");
    std::env::set_var("CMS_RETRY_PRESET", "upstream");
    std::env::set_var("CMS_RETRY_ATTEMPTS", "4");
    std::env::set_var("CMS_MAX_IN_FLIGHT", "8");
    std::env::set_var("CMS_USERNAME", "admin");
    std::env::set_var("CMS_PASSWORD", "admin");

    let settings = Settings::from_env().expect("settings");
    assert_eq!(settings.base_url, "https://author.example.com");
    assert_eq!(settings.cache.backend, CacheBackend::File);
    assert_eq!(settings.cache.strategy, EvictionStrategy::Lfu);
    assert_eq!(settings.cache.on_set_failure, SetFailureMode::Propagate);
    assert_eq!(settings.breaker.failure_threshold, 3);
    assert_eq!(settings.transport.max_in_flight, 8);
    assert_eq!(settings.auth.mode, AuthKind::Basic, "inferred from credentials");

    let retry = settings.retry.to_config().expect("retry");
    assert_eq!(retry.max_attempts, 4);
    assert_eq!(retry.base_delay.as_millis(), 2000);
}

#[tokio::test]
async fn oauth_mode_is_inferred_from_token_url() {
    let _guard = ENV_LOCK.lock().await;
    let _env = EnvSnapshot::take();

    std::env::set_var("CMS_OAUTH_TOKEN_URL", "https://ims.example.com/ims/token/v3");
    std::env::set_var("CMS_OAUTH_CLIENT_ID", "client");
    std::env::set_var("CMS_OAUTH_CLIENT_SECRET", "secret");

    let settings = Settings::from_env().expect("settings");
    assert_eq!(settings.auth.mode, AuthKind::Oauth);
    let oauth = settings.auth.oauth.expect("oauth block");
    assert_eq!(oauth.token_path, "access_token");
}

#[tokio::test]
async fn bad_values_are_rejected() {
    let _guard = ENV_LOCK.lock().await;
    let _env = EnvSnapshot::take();

    std::env::set_var("CMS_CACHE_STRATEGY", "random");
    let err = Settings::from_env().expect_err("unknown strategy");
    assert_eq!(err.code, ErrorCode::ValidationError);
    std::env::remove_var("CMS_CACHE_STRATEGY");

    std::env::set_var("CMS_AUTH_MODE", "bearer");
    assert!(Settings::from_env().is_err(), "bearer without token");
}

#[tokio::test]
async fn app_initializes_from_environment() {
    let _guard = ENV_LOCK.lock().await;
    let _env = EnvSnapshot::take();

    std::env::set_var("CMS_BASE_URL", "http://127.0.0.1:4502");
    std::env::set_var("CMS_TOKEN", "static-token");

    let app = App::initialize().expect("app");
    assert_eq!(app.settings.auth.mode, AuthKind::Bearer);
    assert_eq!(app.pipeline.base_url().as_str(), "http://127.0.0.1:4502/");
    let stats = serde_json::to_value(app.pipeline.stats()).expect("stats");
    assert_eq!(stats["auth"]["mode"], "bearer");
    assert_eq!(stats["cache"]["backend"], "memory");
}
