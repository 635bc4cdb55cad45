//! Job queue counters
//!
//! Lock-free counters shared between the queue, the processor and the health
//! monitor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct QueueMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    enqueued: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    timed_out: AtomicUsize,
    total_duration_ms: AtomicU64,
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_enqueued(&self) {
        self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of an attempt
    pub fn record_started(&self) {
        self.inner.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a job that failed permanently
    pub fn record_failed(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> usize {
        self.inner.enqueued.load(Ordering::Relaxed)
    }

    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> usize {
        self.inner.retried.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> usize {
        self.inner.timed_out.load(Ordering::Relaxed)
    }

    /// Share of finished jobs that failed permanently
    pub fn failure_ratio(&self) -> f64 {
        let failed = self.failed();
        let finished = self.completed() + failed;
        if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        }
    }

    pub fn avg_duration_ms(&self) -> u64 {
        let completed = self.completed() as u64;
        if completed == 0 {
            0
        } else {
            self.inner.total_duration_ms.load(Ordering::Relaxed) / completed
        }
    }

    pub fn summary(&self) -> QueueMetricsSummary {
        QueueMetricsSummary {
            enqueued: self.enqueued(),
            started: self.started(),
            completed: self.completed(),
            failed: self.failed(),
            retried: self.retried(),
            timed_out: self.timed_out(),
            failure_ratio: self.failure_ratio(),
            avg_duration_ms: self.avg_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetricsSummary {
    pub enqueued: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub timed_out: usize,
    pub failure_ratio: f64,
    pub avg_duration_ms: u64,
}
