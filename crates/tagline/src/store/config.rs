//! Store configuration.

use crate::lifecycle::PolicySet;
use crate::wal::WalConfig;
use std::time::Duration;

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Default width of a change-feed time bucket (1 hour).
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(60 * 60);

/// Default number of `(entity, key)` pairs each shard's filter is sized for.
pub const DEFAULT_FILTER_CAPACITY: usize = 100_000;

/// Default number of versions fetched per history page.
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 256;

/// Default number of entity lock attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

/// Default delay after the first failed lock attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_micros(50);

/// Default cap on the delay between lock attempts.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(5);

/// Bounded exponential backoff for acquiring an entity's write section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts before [`TagError::ConcurrentModification`](crate::TagError::ConcurrentModification) is returned.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each failure.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Configuration for a [`TagStore`](crate::TagStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of shards entities are spread over. Fixed for the lifetime of
    /// a store directory.
    pub shard_count: usize,
    /// Width of a change-feed time bucket.
    pub bucket_width: Duration,
    /// Pairs each shard's existence filter is sized for.
    pub filter_capacity: usize,
    /// Versions fetched per history page.
    pub history_page_size: usize,
    /// WAL settings shared by all shards.
    pub wal: WalConfig,
    /// Entity lock retry settings.
    pub retry: RetryConfig,
    /// Initial retention policies.
    pub policies: PolicySet,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            bucket_width: DEFAULT_BUCKET_WIDTH,
            filter_capacity: DEFAULT_FILTER_CAPACITY,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            wal: WalConfig::default(),
            retry: RetryConfig::default(),
            policies: PolicySet::new(),
        }
    }
}

impl StoreConfig {
    /// Sets the shard count.
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Sets the change-feed bucket width.
    pub fn with_bucket_width(mut self, bucket_width: Duration) -> Self {
        self.bucket_width = bucket_width;
        self
    }

    /// Sets the per-shard filter capacity.
    pub fn with_filter_capacity(mut self, filter_capacity: usize) -> Self {
        self.filter_capacity = filter_capacity;
        self
    }

    /// Sets the history page size.
    pub fn with_history_page_size(mut self, history_page_size: usize) -> Self {
        self.history_page_size = history_page_size;
        self
    }

    /// Sets the WAL configuration.
    pub fn with_wal_config(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the retention policies.
    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    /// Bucket width in nanoseconds, at least 1.
    pub(crate) fn bucket_width_nanos(&self) -> i64 {
        i64::try_from(self.bucket_width.as_nanos())
            .unwrap_or(i64::MAX)
            .max(1)
    }
}
