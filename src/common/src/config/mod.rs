use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::cron::CronPattern;
use crate::job::{JobType, Priority};

pub const CONFIG_FILE: &str = "cadenza.toml";
pub const ENV_PREFIX: &str = "CADENZA__";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `memory://` or `sqlite://path/to/file.db`
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("memory://"),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.dsn.starts_with("memory:") || self.dsn.starts_with("sqlite:"),
            "database.dsn must start with 'memory:' or 'sqlite:', got '{}'",
            self.dsn
        );
        Ok(())
    }
}

/// Job queue tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// First retry delay; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub base_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    /// Pause between back-to-back jobs
    #[serde(with = "humantime_serde")]
    pub throttle: Duration,
    /// How long the loop waits before re-checking an empty queue
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
    /// Finished jobs kept for inspection
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            throttle: Duration::from_millis(100),
            idle_poll: Duration::from_secs(1),
            history_limit: 1000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.base_retry_delay.is_zero(),
            "queue.base_retry_delay must be greater than 0"
        );
        ensure!(
            self.max_retry_delay >= self.base_retry_delay,
            "queue.max_retry_delay must not be smaller than queue.base_retry_delay"
        );
        ensure!(!self.idle_poll.is_zero(), "queue.idle_poll must be greater than 0");
        ensure!(self.history_limit > 0, "queue.history_limit must be greater than 0");
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.failure_threshold > 0,
            "circuit_breaker.failure_threshold must be greater than 0"
        );
        ensure!(
            !self.reset_timeout.is_zero(),
            "circuit_breaker.reset_timeout must be greater than 0"
        );
        Ok(())
    }
}

/// A recurring maintenance job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecurringJobConfig {
    pub name: String,
    pub cron: CronPattern,
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl RecurringJobConfig {
    pub fn new(name: &str, cron: &str, job_type: JobType) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            cron: CronPattern::parse(cron)?,
            job_type,
            priority: None,
            max_retries: None,
            timeout: None,
        })
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or(self.job_type.default_priority())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(self.job_type.default_max_retries())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.job_type.default_timeout())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    pub recurring: Vec<RecurringJobConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let recurring = [
            ("orphan-cleanup", "0 2 * * *", JobType::OrphanedReferenceCleanup),
            ("integrity-validation", "0 3 * * 0", JobType::IntegrityValidation),
            ("audit-log-archive", "0 4 1 * *", JobType::AuditLogArchive),
        ]
        .into_iter()
        .filter_map(|(name, cron, job_type)| RecurringJobConfig::new(name, cron, job_type).ok())
        .collect();

        Self {
            enabled: true,
            tick_interval: Duration::from_secs(60),
            recurring,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.tick_interval.is_zero(),
            "scheduler.tick_interval must be greater than 0"
        );
        for (i, job) in self.recurring.iter().enumerate() {
            ensure!(
                !job.name.trim().is_empty(),
                "scheduler.recurring[{i}].name must not be empty"
            );
            if self.recurring[..i].iter().any(|other| other.name == job.name) {
                bail!("scheduler.recurring contains duplicate name '{}'", job.name);
            }
            ensure!(
                !job.timeout().is_zero(),
                "scheduler.recurring[{i}].timeout must be greater than 0"
            );
            ensure!(
                !job.job_type.is_deletion(),
                "scheduler.recurring[{i}] cannot schedule '{}' jobs",
                job.job_type
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// How long a deletion snapshot stays eligible for rollback
    #[serde(with = "humantime_serde")]
    pub snapshot_ttl: Duration,
    /// Sample documents per relationship in an impact report
    pub sample_size: usize,
    /// Confirmation credential required for hard deletes. Hard delete is
    /// refused while unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_delete_secret: Option<String>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            sample_size: 3,
            hard_delete_secret: None,
        }
    }
}

impl CascadeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.snapshot_ttl.is_zero(),
            "cascade.snapshot_ttl must be greater than 0"
        );
        ensure!(self.sample_size > 0, "cascade.sample_size must be greater than 0");
        if let Some(secret) = &self.hard_delete_secret {
            ensure!(
                !secret.is_empty(),
                "cascade.hard_delete_secret must not be empty when set"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub audit_retention_months: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            audit_retention_months: 12,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.audit_retention_months > 0,
            "retention.audit_retention_months must be greater than 0"
        );
        Ok(())
    }
}

/// Orphaned reference cleanup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanCleanupConfig {
    /// Report orphans without detaching them
    pub dry_run: bool,
    /// References processed per batch
    pub batch_size: usize,
}

impl Default for OrphanCleanupConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 500,
        }
    }
}

impl OrphanCleanupConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.batch_size > 0,
            "orphan_cleanup.batch_size must be greater than 0"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub history_limit: usize,
    pub critical_history_limit: usize,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_limit: 500,
            critical_history_limit: 100,
            channel_capacity: 1024,
        }
    }
}

impl EventsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.history_limit > 0, "events.history_limit must be greater than 0");
        ensure!(
            self.critical_history_limit > 0,
            "events.critical_history_limit must be greater than 0"
        );
        ensure!(
            self.channel_capacity > 0,
            "events.channel_capacity must be greater than 0"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Queue length above which a backlog alert is raised
    pub backlog_threshold: usize,
    /// Share of failed jobs above which an alert is raised
    pub failure_ratio_threshold: f64,
    /// Bounded wait for in-flight jobs at shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(60),
            backlog_threshold: 100,
            failure_ratio_threshold: 0.10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.sample_interval.is_zero(),
            "health.sample_interval must be greater than 0"
        );
        ensure!(
            self.backlog_threshold > 0,
            "health.backlog_threshold must be greater than 0"
        );
        ensure!(
            self.failure_ratio_threshold > 0.0 && self.failure_ratio_threshold <= 1.0,
            "health.failure_ratio_threshold must be in (0, 1]"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: String::from("0.0.0.0:3000"),
        }
    }
}

impl HttpConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("http.bind '{}' is not a socket address", self.bind))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.socket_addr().map(|_| ())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub scheduler: SchedulerConfig,
    pub cascade: CascadeConfig,
    pub retention: RetentionConfig,
    pub orphan_cleanup: OrphanCleanupConfig,
    pub events: EventsConfig,
    pub health: HealthConfig,
    pub http: HttpConfig,
}

impl Configuration {
    /// Load defaults, then `cadenza.toml`, then `CADENZA__*` environment variables.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(None)
    }

    /// Like [`Configuration::load`], reading the TOML layer from `path` when given.
    pub fn load_from_path(path: Option<&Path>) -> Result<Self, Box<figment::Error>> {
        let toml = match path {
            Some(path) => Toml::file(path),
            None => Toml::file(CONFIG_FILE),
        };

        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(toml)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.database.validate()?;
        self.queue.validate()?;
        self.circuit_breaker.validate()?;
        self.scheduler.validate()?;
        self.cascade.validate()?;
        self.retention.validate()?;
        self.orphan_cleanup.validate()?;
        self.events.validate()?;
        self.health.validate()?;
        self.http.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert_eq!(config.database.dsn, "memory://");
        assert_eq!(config.queue.base_retry_delay, Duration::from_secs(1));
        assert_eq!(config.queue.max_retry_delay, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.cascade.sample_size, 3);
        assert_eq!(config.retention.audit_retention_months, 12);
        assert_eq!(config.health.backlog_threshold, 100);
        assert!(config.cascade.hard_delete_secret.is_none());

        // Three maintenance jobs are scheduled out of the box
        let names: Vec<_> = config.scheduler.recurring.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["orphan-cleanup", "integrity-validation", "audit-log-archive"]
        );
        assert_eq!(config.scheduler.recurring[1].cron.as_str(), "0 3 * * 0");
        assert_eq!(config.scheduler.recurring[2].max_retries(), 2);

        config.validate().unwrap();
    }

    #[test]
    fn test_configless_operation() {
        // Defaults survive a round trip through figment without any file
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.database.dsn, "memory://");
        assert_eq!(config.cascade.snapshot_ttl, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(config.scheduler.recurring.len(), 3);
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [database]
                dsn = "sqlite://.data/cadenza.db"

                [queue]
                throttle = "250ms"

                [cascade]
                hard_delete_secret = "s3cret"

                [[scheduler.recurring]]
                name = "nightly-orphans"
                cron = "30 1 * * *"
                job_type = "orphanedReferenceCleanup"
                "#,
            )?;
            jail.set_env("CADENZA__HEALTH__BACKLOG_THRESHOLD", "250");
            jail.set_env("CADENZA__DATABASE__DSN", "sqlite://./override.db");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.database.dsn, "sqlite://./override.db");
            assert_eq!(config.queue.throttle, Duration::from_millis(250));
            assert_eq!(config.health.backlog_threshold, 250);
            assert_eq!(config.cascade.hard_delete_secret.as_deref(), Some("s3cret"));
            assert_eq!(config.scheduler.recurring.len(), 1);
            assert_eq!(
                config.scheduler.recurring[0].priority(),
                JobType::OrphanedReferenceCleanup.default_priority()
            );
            Ok(())
        });
    }

    #[test]
    fn test_invalid_cron_is_rejected_at_load() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                [[scheduler.recurring]]
                name = "broken"
                cron = "0 2 * *"
                job_type = "auditLogArchive"
                "#,
            )?;
            let result = Configuration::load_from_path(Some(Path::new("custom.toml")));
            assert!(result.is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Configuration::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.health.sample_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.http.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.database.dsn = "postgres://localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        let duplicate = config.scheduler.recurring[0].clone();
        config.scheduler.recurring.push(duplicate);
        assert!(config.validate().is_err());
    }
}
