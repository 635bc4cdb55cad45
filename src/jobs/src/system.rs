//! System bootstrap and graceful shutdown.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cascade::integrity::{AuditRetention, IntegrityValidator, OrphanScanner};
use cascade::{AuditStore, CascadeExecutor, ImpactAnalyzer, Registry};
use common::config::Configuration;
use common::job::JobType;
use common::store::DocumentStore;
use messaging::{EventBus, EventSink};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::handlers::{
    AuditArchiveHandler, BatchCascadeDeletionHandler, CascadeDeletionHandler, HandlerRegistry,
    IntegrityValidationHandler, OrphanCleanupHandler,
};
use crate::health::HealthMonitor;
use crate::processor::Processor;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;

/// Shared services handed to request handlers.
#[derive(Debug, Clone)]
pub struct SystemHandle {
    pub store: Arc<dyn DocumentStore>,
    pub analyzer: ImpactAnalyzer,
    pub executor: CascadeExecutor,
    pub scanner: OrphanScanner,
    pub queue: JobQueue,
    pub events: EventBus,
    pub health: HealthMonitor,
}

impl SystemHandle {
    pub fn audit(&self) -> &AuditStore {
        self.executor.audit()
    }
}

/// The running engine: job processor, scheduler and health monitor on top
/// of the cascade services.
#[derive(Debug)]
pub struct System {
    handle: SystemHandle,
    scheduler: Option<Scheduler>,
    shutdown: watch::Sender<bool>,
    processor: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

/// Collections the registry reads or writes.
fn expected_collections(registry: &Registry) -> BTreeSet<String> {
    registry
        .all()
        .flat_map(|(kind, relationship)| {
            [
                kind.collection().to_string(),
                relationship.owner_collection.clone(),
            ]
        })
        .collect()
}

async fn verify_store(store: &dyn DocumentStore, registry: &Registry) -> Result<()> {
    store.ping().await.context("Document store is unreachable")?;

    let present: BTreeSet<String> = store
        .list_collections()
        .await
        .context("Failed to list collections")?
        .into_iter()
        .collect();
    for missing in expected_collections(registry).difference(&present) {
        tracing::warn!(collection = %missing, "Expected collection is missing");
    }
    Ok(())
}

impl System {
    pub async fn start(config: &Configuration, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let registry = Arc::new(Registry::conservatory());
        verify_store(store.as_ref(), &registry).await?;

        let audit = AuditStore::new(store.clone());
        if let Err(e) = audit.ensure_indexes().await {
            // Deletions still work; audit listing is just slower
            tracing::warn!("Failed to prepare audit collections: {e}");
        }

        let events = EventBus::new(&config.events);
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());

        let analyzer = ImpactAnalyzer::new(store.clone(), registry.clone(), config.cascade.sample_size);
        let executor =
            CascadeExecutor::new(store.clone(), registry.clone(), &config.cascade).with_events(sink.clone());
        let scanner = OrphanScanner::new(
            store.clone(),
            registry.clone(),
            config.orphan_cleanup.batch_size,
        )
        .with_events(sink.clone());
        let validator = IntegrityValidator::new(store.clone(), registry.clone()).with_events(sink.clone());
        let retention = AuditRetention::new(store.clone(), config.retention.audit_retention_months);

        let handlers = HandlerRegistry::new()
            .with(
                JobType::CascadeDeletion,
                Arc::new(CascadeDeletionHandler::new(executor.clone())),
            )
            .with(
                JobType::BatchCascadeDeletion,
                Arc::new(BatchCascadeDeletionHandler::new(executor.clone())),
            )
            .with(
                JobType::OrphanedReferenceCleanup,
                Arc::new(OrphanCleanupHandler::new(
                    scanner.clone(),
                    config.orphan_cleanup.dry_run,
                )),
            )
            .with(
                JobType::IntegrityValidation,
                Arc::new(IntegrityValidationHandler::new(validator)),
            )
            .with(
                JobType::AuditLogArchive,
                Arc::new(AuditArchiveHandler::new(retention)),
            );

        let queue = JobQueue::new(&config.queue, &config.circuit_breaker, sink.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let processor =
            Processor::new(queue.clone(), Arc::new(handlers), &config.queue).spawn(shutdown_rx.clone());

        let scheduler = if config.scheduler.enabled {
            let scheduler = Scheduler::new(queue.clone(), &config.scheduler);
            scheduler.start();
            Some(scheduler)
        } else {
            tracing::info!("Recurring jobs are disabled");
            None
        };

        let health = HealthMonitor::new(queue.clone(), sink, &config.health);
        let monitor = health.clone().spawn(shutdown_rx);

        tracing::info!(
            dsn = %config.database.dsn,
            recurring_jobs = scheduler.as_ref().map_or(0, Scheduler::running_timers),
            "Cascade engine started"
        );

        Ok(Self {
            handle: SystemHandle {
                store,
                analyzer,
                executor,
                scanner,
                queue,
                events,
                health,
            },
            scheduler,
            shutdown,
            processor,
            monitor,
        })
    }

    pub fn handle(&self) -> SystemHandle {
        self.handle.clone()
    }

    /// Stop taking jobs, stop the timers, then give the in-flight job up to
    /// `timeout` to finish. Jobs still queued are dropped.
    pub async fn shutdown(self, timeout: Duration) {
        let queue = &self.handle.queue;
        queue.stop_accepting();
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        let _ = self.shutdown.send(true);

        let mut processor = self.processor;
        match tokio::time::timeout(timeout, &mut processor).await {
            Ok(Ok(())) => tracing::debug!("Job processor drained"),
            Ok(Err(e)) => tracing::error!("Job processor task failed: {e}"),
            Err(_) => {
                tracing::warn!(
                    timeout = ?timeout,
                    "In-flight job did not finish in time, abandoning it"
                );
                processor.abort();
            }
        }
        self.monitor.abort();

        let dropped = queue.clear_pending();
        if dropped > 0 {
            tracing::warn!(dropped, "Discarded queued jobs at shutdown");
        }
        tracing::info!("Cascade engine stopped");
    }
}
