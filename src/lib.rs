//! Resilient request core for content-management REST APIs: caching, circuit breaking,
//! retry with backoff, token refresh and response normalization behind one pipeline.

pub mod app;
pub mod config;
pub mod constants;
pub mod errors;

pub mod services {
    pub mod auth;
    pub mod cache;
    pub mod circuit_breaker;
    pub mod file_cache;
    pub mod logger;
    pub mod retry;
    pub mod transport;
}

pub mod managers {
    pub mod pipeline;
}

pub mod utils {
    pub mod feature_flags;
    pub mod fs_atomic;
    pub mod pattern;
    pub mod redact;
    pub mod stable_json;
}

pub use app::App;
pub use config::Settings;
pub use errors::{ErrorCode, RequestError, TransportError};
pub use managers::pipeline::{RequestOptions, RequestPipeline, ResponseEnvelope, RetrySetting};
