//! Configuration for the sync engine.

use std::time::Duration;

/// Smallest accepted queued-sync limit.
pub const QUEUED_SYNC_LIMIT_MIN: usize = 1;
/// Default queued-sync limit.
pub const QUEUED_SYNC_LIMIT_DEFAULT: usize = 32;
/// Largest accepted queued-sync limit.
pub const QUEUED_SYNC_LIMIT_MAX: usize = 4096;

/// Configuration for sync scheduling.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Session timeout for auto syncs.
    pub auto_sync_timeout: Duration,
    /// Session timeout for user-requested syncs.
    pub manual_sync_timeout: Duration,
    /// How long teardown waits for timer and message callbacks to drain.
    pub kill_wait_timeout: Duration,
    /// Retries granted to an auto sync after a retryable failure.
    pub max_auto_retry: u32,
    /// Maximum number of queued manual non-blocking syncs.
    pub queued_sync_limit: usize,
    /// Whether data-change hooks trigger auto syncs.
    pub auto_sync_enabled: bool,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            auto_sync_timeout: Duration::from_secs(5),
            manual_sync_timeout: Duration::from_secs(30),
            kill_wait_timeout: Duration::from_secs(5),
            max_auto_retry: 3,
            queued_sync_limit: QUEUED_SYNC_LIMIT_DEFAULT,
            auto_sync_enabled: true,
        }
    }

    /// Sets the auto sync session timeout.
    pub fn with_auto_sync_timeout(mut self, timeout: Duration) -> Self {
        self.auto_sync_timeout = timeout;
        self
    }

    /// Sets the manual sync session timeout.
    pub fn with_manual_sync_timeout(mut self, timeout: Duration) -> Self {
        self.manual_sync_timeout = timeout;
        self
    }

    /// Sets the teardown drain timeout.
    pub fn with_kill_wait_timeout(mut self, timeout: Duration) -> Self {
        self.kill_wait_timeout = timeout;
        self
    }

    /// Sets the number of auto sync retries.
    pub fn with_max_auto_retry(mut self, retries: u32) -> Self {
        self.max_auto_retry = retries;
        self
    }

    /// Sets the queued-sync limit. Out-of-range values are rejected later
    /// by [`crate::Syncer::set_queued_sync_limit`]; here they are clamped.
    pub fn with_queued_sync_limit(mut self, limit: usize) -> Self {
        self.queued_sync_limit = limit.clamp(QUEUED_SYNC_LIMIT_MIN, QUEUED_SYNC_LIMIT_MAX);
        self
    }

    /// Enables or disables auto sync.
    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync_enabled = enabled;
        self
    }

    /// Session timeout for the given kind of sync.
    pub fn session_timeout(&self, is_auto_sync: bool) -> Duration {
        if is_auto_sync {
            self.auto_sync_timeout
        } else {
            self.manual_sync_timeout
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
