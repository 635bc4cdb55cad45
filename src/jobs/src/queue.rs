//! In-process priority job queue.
//!
//! Ready jobs sit in one list ordered by priority tier and, within a tier,
//! by enqueue order. Retries wait in a [`DelayQueue`] until their backoff
//! elapses and then re-enter at the front of their tier. All state sits
//! behind a single mutex, so enqueues from request handlers and the
//! processing loop never interleave mid-update.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::config::{CircuitBreakerConfig, QueueConfig};
use messaging::{Event, EventSink};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::circuit::CircuitBreaker;
use crate::delay::DelayQueue;
use crate::error::{JobError, Result};
use crate::job::{Job, JobId, JobSpec, JobStatus};
use crate::metrics::{QueueMetrics, QueueMetricsSummary};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub accepting: bool,
    pub queued: usize,
    /// Retries waiting out their backoff
    pub delayed: usize,
    pub processing: usize,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub metrics: QueueMetricsSummary,
}

impl QueueStatus {
    /// Jobs waiting to run, including delayed retries.
    pub fn backlog(&self) -> usize {
        self.queued + self.delayed
    }
}

#[derive(Debug)]
struct QueueState {
    ready: VecDeque<Job>,
    delayed: DelayQueue<Job>,
    processing: Option<Job>,
    history: VecDeque<Job>,
    circuit: CircuitBreaker,
    accepting: bool,
}

impl QueueState {
    /// Insert behind every job of the same or higher priority.
    fn push_fresh(&mut self, job: Job) {
        let rank = job.priority.rank();
        let at = self
            .ready
            .iter()
            .position(|queued| queued.priority.rank() > rank)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, job);
    }

    /// Insert ahead of every job of the same priority.
    fn push_retry(&mut self, job: Job) {
        let rank = job.priority.rank();
        let at = self
            .ready
            .iter()
            .position(|queued| queued.priority.rank() >= rank)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, job);
    }

    fn promote_due(&mut self, now: Instant) {
        let mut due = Vec::new();
        while let Some(job) = self.delayed.pop_due(now) {
            due.push(job);
        }
        // Front-of-tier inserts reverse order, so insert the latest first
        for job in due.into_iter().rev() {
            self.push_retry(job);
        }
    }

    fn archive(&mut self, job: Job, limit: usize) {
        self.history.push_back(job);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    wake: Notify,
    events: Arc<dyn EventSink>,
    metrics: QueueMetrics,
    history_limit: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(
        queue: &QueueConfig,
        circuit: &CircuitBreakerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    ready: VecDeque::new(),
                    delayed: DelayQueue::new(),
                    processing: None,
                    history: VecDeque::new(),
                    circuit: CircuitBreaker::new(circuit),
                    accepting: true,
                }),
                wake: Notify::new(),
                events,
                metrics: QueueMetrics::new(),
                history_limit: queue.history_limit.max(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.inner.events
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.inner.metrics
    }

    /// Queue a job. Never blocks on the processing loop.
    pub fn enqueue(&self, spec: JobSpec) -> Result<JobId> {
        let job = Job::new(spec);
        let (id, job_type, priority) = (job.id, job.job_type, job.priority);
        {
            let mut state = self.state();
            if !state.accepting {
                return Err(JobError::QueueStopped);
            }
            state.push_fresh(job);
        }

        self.inner.metrics.record_enqueued();
        self.inner.events.publish(Event::JobQueued {
            job_id: id,
            job_type,
            priority,
        });
        tracing::info!(job_id = %id, job_type = %job_type, priority = %priority, "Job queued");
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Refuse further submissions. Queued jobs stay where they are.
    pub fn stop_accepting(&self) {
        self.state().accepting = false;
        self.inner.wake.notify_one();
    }

    pub fn is_accepting(&self) -> bool {
        self.state().accepting
    }

    pub fn status(&self) -> QueueStatus {
        let mut state = self.state();
        let circuit_open = state.circuit.is_open(Instant::now());
        QueueStatus {
            accepting: state.accepting,
            queued: state.ready.len(),
            delayed: state.delayed.len(),
            processing: usize::from(state.processing.is_some()),
            circuit_open,
            consecutive_failures: state.circuit.consecutive_failures(),
            metrics: self.inner.metrics.summary(),
        }
    }

    /// Look a job up wherever it currently is.
    pub fn job(&self, id: JobId) -> Option<Job> {
        let state = self.state();
        state
            .processing
            .iter()
            .chain(state.ready.iter())
            .chain(state.delayed.iter())
            .chain(state.history.iter().rev())
            .find(|job| job.id == id)
            .cloned()
    }

    /// Every job that has not finished: the one processing, then queued
    /// jobs in dequeue order, then delayed retries.
    pub fn active_jobs(&self) -> Vec<Job> {
        let state = self.state();
        let mut delayed: Vec<Job> = state.delayed.iter().cloned().collect();
        delayed.sort_by_key(|job| job.created_at);
        state
            .processing
            .iter()
            .chain(state.ready.iter())
            .cloned()
            .chain(delayed)
            .collect()
    }

    /// Finished jobs, most recent first.
    pub fn history(&self, limit: Option<usize>) -> Vec<Job> {
        let state = self.state();
        let limit = limit.unwrap_or(state.history.len());
        state.history.iter().rev().take(limit).cloned().collect()
    }

    /// Wait until a job may be ready, the next delayed retry falls due, or
    /// `idle_poll` elapses, whichever comes first.
    pub(crate) async fn wait_for_work(&self, idle_poll: Duration) {
        let next_retry = self.state().delayed.next_deadline();
        let idle_until = Instant::now() + idle_poll;
        let wake_at = next_retry.map_or(idle_until, |deadline| deadline.min(idle_until));
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = self.inner.wake.notified() => {}
        }
    }

    /// When processing may resume, if the circuit breaker is open.
    pub(crate) fn paused_until(&self, now: Instant) -> Option<Instant> {
        self.state().circuit.open_until(now)
    }

    /// Take the next job to run and mark it processing.
    pub(crate) fn next_ready(&self, now: Instant) -> Option<Job> {
        let mut state = self.state();
        state.promote_due(now);
        let mut job = state.ready.pop_front()?;
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        state.processing = Some(job.clone());
        Some(job)
    }

    pub(crate) fn complete(&self, mut job: Job, result: Value) {
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.finished_at = Some(Utc::now());
        let mut state = self.state();
        state.processing = None;
        state.circuit.record_success();
        state.archive(job, self.inner.history_limit);
    }

    /// Put a failed attempt back after `delay`. Only retryable failures
    /// are retried, so each one counts against the circuit breaker.
    pub(crate) fn retry(&self, mut job: Job, error: &JobError, delay: Duration, now: Instant) {
        job.status = JobStatus::Queued;
        job.error = Some(error.to_string());
        let mut state = self.state();
        state.processing = None;
        state.circuit.record_failure(now);
        state.delayed.push(now + delay, job);
    }

    pub(crate) fn fail(&self, mut job: Job, error: &JobError, now: Instant) {
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.finished_at = Some(Utc::now());
        let mut state = self.state();
        state.processing = None;
        if error.is_retryable() {
            state.circuit.record_failure(now);
        }
        state.archive(job, self.inner.history_limit);
    }

    /// Drop everything still waiting; returns how many jobs were discarded.
    pub(crate) fn clear_pending(&self) -> usize {
        let mut state = self.state();
        let dropped = state.ready.len() + state.delayed.len();
        state.ready.clear();
        state.delayed.drain().for_each(drop);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use common::job::Priority;
    use messaging::EventBus;

    fn queue() -> JobQueue {
        JobQueue::new(
            &QueueConfig::default(),
            &CircuitBreakerConfig::default(),
            Arc::new(messaging::NullSink),
        )
    }

    fn spec(priority: Priority) -> JobSpec {
        JobSpec::new(JobPayload::IntegrityValidation).with_priority(priority)
    }

    fn drain(queue: &JobQueue) -> Vec<JobId> {
        let now = Instant::now();
        std::iter::from_fn(|| {
            let job = queue.next_ready(now)?;
            queue.complete(job.clone(), Value::Null);
            Some(job.id)
        })
        .collect()
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = queue();
        let low = queue.enqueue(spec(Priority::Low)).unwrap();
        let high_a = queue.enqueue(spec(Priority::High)).unwrap();
        let medium = queue.enqueue(spec(Priority::Medium)).unwrap();
        let high_b = queue.enqueue(spec(Priority::High)).unwrap();

        assert_eq!(drain(&queue), vec![high_a, high_b, medium, low]);
    }

    #[tokio::test]
    async fn test_retry_goes_to_front_of_its_tier() {
        let queue = queue();
        let first = queue.enqueue(spec(Priority::Medium)).unwrap();
        let now = Instant::now();
        let job = queue.next_ready(now).unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.attempts, 1);

        let high = queue.enqueue(spec(Priority::High)).unwrap();
        let second = queue.enqueue(spec(Priority::Medium)).unwrap();
        queue.retry(job, &JobError::Handler("boom".into()), Duration::ZERO, now);

        assert_eq!(drain(&queue), vec![high, first, second]);
        let retried = queue.job(first).unwrap();
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_retry_waits_for_deadline() {
        let queue = queue();
        queue.enqueue(spec(Priority::Low)).unwrap();
        let now = Instant::now();
        let job = queue.next_ready(now).unwrap();
        queue.retry(job, &JobError::Handler("boom".into()), Duration::from_secs(2), now);

        assert!(queue.next_ready(now).is_none());
        assert_eq!(queue.status().delayed, 1);
        assert_eq!(queue.active_jobs().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let job = queue.next_ready(Instant::now()).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error.as_deref(), Some("Job handler failed: boom"));
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects_jobs() {
        let queue = queue();
        queue.stop_accepting();
        assert!(matches!(
            queue.enqueue(spec(Priority::High)),
            Err(JobError::QueueStopped)
        ));
        assert!(!queue.status().accepting);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let config = QueueConfig {
            history_limit: 2,
            ..QueueConfig::default()
        };
        let queue = JobQueue::new(
            &config,
            &CircuitBreakerConfig::default(),
            Arc::new(messaging::NullSink),
        );
        let ids: Vec<_> = (0..3)
            .map(|_| queue.enqueue(spec(Priority::Low)).unwrap())
            .collect();
        drain(&queue);

        let history: Vec<_> = queue.history(None).iter().map(|j| j.id).collect();
        assert_eq!(history, vec![ids[2], ids[1]]);
        assert!(queue.job(ids[0]).is_none());
        assert_eq!(queue.history(Some(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_publishes_event() {
        let bus = EventBus::new(&common::config::EventsConfig::default());
        let queue = JobQueue::new(
            &QueueConfig::default(),
            &CircuitBreakerConfig::default(),
            Arc::new(bus.clone()),
        );
        let id = queue.enqueue(spec(Priority::Medium)).unwrap();

        let recent = bus.recent(None);
        assert_eq!(recent.len(), 1);
        assert_eq!(
            recent[0].event,
            Event::JobQueued {
                job_id: id,
                job_type: common::job::JobType::IntegrityValidation,
                priority: Priority::Medium,
            }
        );
        assert_eq!(queue.metrics().enqueued(), 1);
    }
}
