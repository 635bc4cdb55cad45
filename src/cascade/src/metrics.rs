//! Cascade metrics tracking
//!
//! Atomic counters shared between the executor and the health monitor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Thread-safe metrics for cascade executions and restores
#[derive(Debug, Clone)]
pub struct CascadeMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    executions: AtomicUsize,
    failures: AtomicUsize,
    restorations: AtomicUsize,
    documents_affected: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl Default for CascadeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CascadeMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                executions: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                restorations: AtomicUsize::new(0),
                documents_affected: AtomicU64::new(0),
                total_duration_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Record a committed cascade
    pub fn record_execution(&self, documents_affected: u64, duration: Duration) {
        self.inner.executions.fetch_add(1, Ordering::Relaxed);
        self.inner
            .documents_affected
            .fetch_add(documents_affected, Ordering::Relaxed);
        self.inner
            .total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a cascade or restore that rolled back
    pub fn record_failure(&self) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restoration(&self) {
        self.inner.restorations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executions(&self) -> usize {
        self.inner.executions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.inner.failures.load(Ordering::Relaxed)
    }

    pub fn restorations(&self) -> usize {
        self.inner.restorations.load(Ordering::Relaxed)
    }

    pub fn documents_affected(&self) -> u64 {
        self.inner.documents_affected.load(Ordering::Relaxed)
    }

    /// Average duration of a committed cascade
    pub fn avg_duration_ms(&self) -> f64 {
        let total_ms = self.inner.total_duration_ms.load(Ordering::Relaxed) as f64;
        let executions = self.executions() as f64;

        if executions > 0.0 { total_ms / executions } else { 0.0 }
    }

    pub fn summary(&self) -> CascadeMetricsSummary {
        CascadeMetricsSummary {
            executions: self.executions(),
            failures: self.failures(),
            restorations: self.restorations(),
            documents_affected: self.documents_affected(),
            avg_duration_ms: self.avg_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeMetricsSummary {
    pub executions: usize,
    pub failures: usize,
    pub restorations: usize,
    pub documents_affected: u64,
    pub avg_duration_ms: f64,
}
