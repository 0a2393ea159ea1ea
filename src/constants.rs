pub mod network {
    pub const TIMEOUT_REQUEST_MS: u64 = 30_000;
    pub const TIMEOUT_CONNECT_MS: u64 = 5_000;
    pub const POOL_IDLE_TIMEOUT_MS: u64 = 90_000;
    pub const POOL_MAX_IDLE_PER_HOST: usize = 32;
    pub const MAX_IN_FLIGHT: usize = 64;
    pub const TCP_KEEPALIVE_MS: u64 = 30_000;
    pub const USER_AGENT: &str = "cms-bridge/0.4";
}

pub mod retry {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY_MS: u64 = 1_000;
    pub const MAX_DELAY_MS: u64 = 10_000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    pub mod upstream {
        pub const MAX_ATTEMPTS: u32 = 5;
        pub const BASE_DELAY_MS: u64 = 2_000;
        pub const MAX_DELAY_MS: u64 = 30_000;
    }

    pub mod cache {
        pub const MAX_ATTEMPTS: u32 = 2;
        pub const BASE_DELAY_MS: u64 = 100;
        pub const MAX_DELAY_MS: u64 = 1_000;
    }

    pub mod bulk {
        pub const MAX_ATTEMPTS: u32 = 3;
        pub const BASE_DELAY_MS: u64 = 5_000;
        pub const MAX_DELAY_MS: u64 = 60_000;
        pub const BACKOFF_MULTIPLIER: f64 = 1.5;
    }
}

pub mod cache {
    pub const DEFAULT_TTL_MS: u64 = 300_000;
    pub const MAX_ENTRIES: usize = 1_000;
    pub const CLEANUP_INTERVAL_MS: u64 = 60_000;
    pub const EVICTION_PERCENT: usize = 10;
    pub const KEY_PREFIX: &str = "cms";
}

pub mod breaker {
    pub const FAILURE_THRESHOLD: u32 = 5;
    pub const RECOVERY_TIMEOUT_MS: u64 = 60_000;
    pub const MONITORING_PERIOD_MS: u64 = 60_000;
}

pub mod auth {
    pub const EXPIRY_BUFFER_MS: u64 = 30_000;
    pub const DEFAULT_TOKEN_TTL_MS: u64 = 3_600_000;
}

pub mod redaction {
    pub const MAX_LOG_STRING: usize = 4 * 1024;
    pub const MAX_DETAIL_STRING: usize = 16 * 1024;
}
