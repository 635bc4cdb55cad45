//! Background job processing for the cascade engine.
//!
//! A single-consumer priority queue with retry backoff and a circuit
//! breaker, the recurring maintenance scheduler, queue health sampling, and
//! the [`System`] that wires them to the cascade services.

pub mod circuit;
pub mod delay;
pub mod error;
pub mod handlers;
pub mod health;
pub mod job;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod system;

pub use error::{JobError, Result};
pub use handlers::{HandlerRegistry, JobHandler};
pub use health::{HealthAlert, HealthMonitor, HealthReport};
pub use job::{Job, JobId, JobPayload, JobSpec, JobStatus};
pub use metrics::{QueueMetrics, QueueMetricsSummary};
pub use queue::{JobQueue, QueueStatus};
pub use scheduler::Scheduler;
pub use system::{System, SystemHandle};
