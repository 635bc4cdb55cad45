//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{Configuration, DatabaseConfig};

/// Builder for creating test configurations.
///
/// Starts from the production defaults and offers shortcuts for the knobs
/// tests usually touch: store DSN, queue timings, scheduler and the
/// hard-delete confirmation secret.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .with_fast_queue()
///     .without_scheduler()
///     .with_hard_delete_secret("letmein")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// Create a builder over the default configuration (in-memory store).
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// Set the database DSN.
    pub fn with_database_dsn(mut self, dsn: &str) -> Self {
        self.config.database = DatabaseConfig {
            dsn: dsn.to_string(),
        };
        self
    }

    /// Use a file-backed SQLite store in `dir` (typically a `TempDir`).
    pub fn with_sqlite_dir(self, dir: &str) -> Self {
        self.with_database_dsn(&format!("sqlite://{dir}/cadenza.db"))
    }

    /// Shrink queue delays so tests drain quickly.
    pub fn with_fast_queue(mut self) -> Self {
        self.config.queue.throttle = Duration::from_millis(1);
        self.config.queue.idle_poll = Duration::from_millis(5);
        self.config.queue.base_retry_delay = Duration::from_millis(10);
        self.config.queue.max_retry_delay = Duration::from_millis(50);
        self
    }

    /// Disable recurring maintenance jobs.
    pub fn without_scheduler(mut self) -> Self {
        self.config.scheduler.enabled = false;
        self
    }

    /// Allow hard deletes confirmed with `secret`.
    pub fn with_hard_delete_secret(mut self, secret: &str) -> Self {
        self.config.cascade.hard_delete_secret = Some(secret.to_string());
        self
    }

    /// Set how long deletion snapshots remain eligible for rollback.
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.config.cascade.snapshot_ttl = ttl;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Configuration {
        self.config
    }
}
