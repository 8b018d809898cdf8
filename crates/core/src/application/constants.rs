// Engine constants (no magic values)
use std::time::Duration;

/// Shortest wait the scheduler timer is ever armed for
pub const TIMER_MIN_DUR: Duration = Duration::from_millis(20);

/// Longest wait the scheduler timer is ever armed for
pub const TIMER_MAX_DUR: Duration = Duration::from_secs(30 * 60);

/// Wake-up period when the store reports no upcoming job
pub const IDLE_RECHECK_PERIOD: Duration = Duration::from_secs(60);

/// Timer back-off after a store error during a tick (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Max jobs claimed per scheduler tick
pub const CLAIM_BATCH_SIZE: usize = 100;

/// Capacity of the scheduler's due-time signal channel
pub const SIGNAL_CHANNEL_SIZE: usize = 256;

/// Default retry base delay (1s)
pub const DEFAULT_RETRY_BASE_DELAY_MS: i64 = 1000;

/// Default retry delay ceiling (1h)
pub const DEFAULT_RETRY_MAX_DELAY_MS: i64 = 60 * 60 * 1000;

/// Default exponential backoff factor
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Poll interval of a background service waiting for leadership
pub const DEFAULT_BACKGROUND_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Retention window of the purge job (30 days)
pub const DEFAULT_PURGE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
