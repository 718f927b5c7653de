// Constants used throughout the application
// Centralizes magic numbers for maintainability

/// Byte size constants
pub mod units {
    /// Kibibyte (1024 bytes)
    pub const KIB: u64 = 1024;

    /// Mebibyte (1024 KiB)
    pub const MIB: u64 = KIB * 1024;

    /// Gibibyte (1024 MiB)
    pub const GIB: u64 = MIB * 1024;
}

/// Default configuration values
pub mod defaults {
    /// Seconds a file must stay quiet before it is considered closed
    pub const QUIET_PERIOD_SECONDS: i64 = 45;

    /// Seconds between watcher ticks and role reconciliation passes
    pub const WATCH_POLL_SECONDS: u64 = 5;

    /// Default container for remux actions
    pub const REMUX_FORMAT: &str = "mov";

    /// Minimum duration before a proxy is worth building
    pub const PROXY_MIN_DURATION_SECONDS: i64 = 900;

    /// Default proxy profile
    pub const PROXY_PROFILE: &str = "dnxhr_lb";

    /// CPU guardrail threshold (percent)
    pub const CPU_GUARD_PCT: f64 = 70.0;

    /// GPU guardrail threshold (percent)
    pub const GPU_GUARD_PCT: f64 = 40.0;

    /// Concurrent worker tasks
    pub const WORKER_PARALLELISM: usize = 2;

    /// File extensions the watcher reacts to
    pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "flv", "ts", "m2ts"];
}

/// File stability checking constants
pub mod stability {
    /// Delay between the two size samples in milliseconds
    pub const SAMPLE_GAP_MS: u64 = 1000;
}

/// Job queue constants
pub mod jobs {
    /// Default maximum retries before a job fails permanently
    pub const MAX_RETRIES: i64 = 3;

    /// Base of the exponential retry backoff in seconds
    pub const BACKOFF_BASE_SECONDS: i64 = 5;

    /// Backoff ceiling in seconds (10 minutes)
    pub const BACKOFF_MAX_SECONDS: i64 = 600;

    /// Dispatcher idle sleep when the queue is empty, in milliseconds
    pub const DISPATCH_IDLE_MS: u64 = 500;

    /// Poll interval used when an action waits for its job, in milliseconds
    pub const AWAIT_POLL_MS: u64 = 250;
}

/// Guardrail sampling constants
pub mod guardrails {
    /// Seconds between CPU/GPU samples
    pub const SAMPLE_INTERVAL_SECONDS: u64 = 2;

    /// Seconds between guard re-checks while a rule is deferred
    pub const RETRY_INTERVAL_SECONDS: u64 = 1;

    /// Wall-clock budget for a deferred rule before it gives up (15 minutes)
    pub const DEFER_DEADLINE_SECONDS: u64 = 900;
}

/// Hashing constants
pub mod hashing {
    use super::units::{KIB, MIB};

    /// Chunk size used for partial hashing (64 KiB)
    pub const CHUNK_SIZE: u64 = 64 * KIB;

    /// Files above this size are hashed by sampled chunks (100 MiB)
    pub const PARTIAL_HASH_THRESHOLD: u64 = 100 * MIB;

    /// Hex characters kept from a SHA-256 digest for ids
    pub const ID_HEX_LEN: usize = 16;
}

/// FFmpeg execution constants
pub mod ffmpeg {
    /// Maximum stderr lines to store (prevent memory exhaustion)
    pub const MAX_STDERR_LINES: usize = 1000;

    /// Default timeout for media jobs in seconds (2 hours)
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600 * 2;
}
