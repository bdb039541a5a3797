//! Task pool configuration.

use std::time::Duration;

/// Default bounded wait used by drain-waits (`Listener::detach(true)`,
/// context kill-waits).
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for starting a [`crate::TaskPool`].
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Workers kept alive while idle.
    pub min_threads: usize,

    /// Hard cap on concurrently alive workers.
    pub max_threads: usize,

    /// How long a worker above `min_threads` waits for work before exiting.
    pub idle_timeout: Duration,

    /// Thread name prefix for workers.
    pub thread_name: String,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 8,
            idle_timeout: Duration::from_secs(1),
            thread_name: "meshkv-worker".to_string(),
        }
    }
}

impl TaskPoolConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum number of workers.
    #[must_use]
    pub const fn min_threads(mut self, value: usize) -> Self {
        self.min_threads = value;
        self
    }

    /// Sets the maximum number of workers.
    #[must_use]
    pub const fn max_threads(mut self, value: usize) -> Self {
        self.max_threads = value;
        self
    }

    /// Sets how long surplus workers linger when idle.
    #[must_use]
    pub const fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name(mut self, value: impl Into<String>) -> Self {
        self.thread_name = value.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TaskPoolConfig::default();
        assert_eq!(config.min_threads, 1);
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
    }

    #[test]
    fn builder_pattern() {
        let config = TaskPoolConfig::new()
            .min_threads(2)
            .max_threads(4)
            .idle_timeout(Duration::from_millis(50))
            .thread_name("notify");

        assert_eq!(config.min_threads, 2);
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.idle_timeout, Duration::from_millis(50));
        assert_eq!(config.thread_name, "notify");
    }
}
