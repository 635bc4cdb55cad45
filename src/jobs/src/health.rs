//! Periodic queue health sampling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::HealthConfig;
use messaging::{Event, EventSink, Severity};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queue::{JobQueue, QueueStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "alert", content = "value", rename_all = "camelCase")]
pub enum HealthAlert {
    CircuitOpen,
    /// Jobs waiting, queued plus delayed
    Backlog(usize),
    /// Share of finished jobs that failed
    FailureRatio(f64),
}

impl HealthAlert {
    fn name(&self) -> &'static str {
        match self {
            HealthAlert::CircuitOpen => "circuitOpen",
            HealthAlert::Backlog(_) => "backlog",
            HealthAlert::FailureRatio(_) => "failureRatio",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            HealthAlert::CircuitOpen => Severity::Critical,
            HealthAlert::Backlog(_) | HealthAlert::FailureRatio(_) => Severity::High,
        }
    }

    fn message(&self) -> String {
        match self {
            HealthAlert::CircuitOpen => {
                "Circuit breaker is open; job processing is paused".to_string()
            }
            HealthAlert::Backlog(len) => format!("{len} jobs are waiting in the queue"),
            HealthAlert::FailureRatio(ratio) => {
                format!("{:.1}% of processed jobs failed", ratio * 100.0)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub alerts: Vec<HealthAlert>,
    pub queue: QueueStatus,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    queue: JobQueue,
    events: Arc<dyn EventSink>,
    config: HealthConfig,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(queue: JobQueue, events: Arc<dyn EventSink>, config: &HealthConfig) -> Self {
        Self {
            queue,
            events,
            config: config.clone(),
        }
    }

    /// Inspect the queue without publishing anything.
    pub fn check(&self) -> HealthReport {
        let queue = self.queue.status();
        let mut alerts = Vec::new();

        if queue.circuit_open {
            alerts.push(HealthAlert::CircuitOpen);
        }
        if queue.backlog() > self.config.backlog_threshold {
            alerts.push(HealthAlert::Backlog(queue.backlog()));
        }
        if queue.metrics.failure_ratio > self.config.failure_ratio_threshold {
            alerts.push(HealthAlert::FailureRatio(queue.metrics.failure_ratio));
        }

        HealthReport {
            healthy: alerts.is_empty(),
            alerts,
            queue,
            checked_at: Utc::now(),
        }
    }

    /// Check the queue and raise every alert found as a system alert event.
    pub fn sample(&self) -> HealthReport {
        let report = self.check();
        for alert in &report.alerts {
            let message = alert.message();
            tracing::warn!(alert = alert.name(), "{message}");
            self.events.publish(Event::SystemAlert {
                severity: alert.severity(),
                alert: alert.name().to_string(),
                message,
            });
        }
        if report.healthy {
            tracing::debug!(backlog = report.queue.backlog(), "Job queue healthy");
        }
        report
    }

    /// Sample every `sample_interval` until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sample_interval);
            // The first tick completes immediately; skip it so startup is
            // not reported before anything ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sample();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
