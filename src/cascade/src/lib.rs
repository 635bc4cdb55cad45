//! Cascade deletion engine.
//!
//! Previews, executes and reverses the deletion of a conservatory entity
//! together with every document referencing it, and runs the integrity
//! routines that keep cross-collection references consistent.

pub mod analyzer;
pub mod audit;
pub mod error;
pub mod executor;
pub mod integrity;
pub mod metrics;
pub mod registry;
pub mod snapshot;

pub use analyzer::{ImpactAnalyzer, ImpactLevel, ImpactReport, Warning, WarningKind};
pub use audit::{AuditQuery, AuditRecord, AuditStore, CascadeOperation, DeletionType, OperationKind, Page};
pub use error::{CascadeError, Result};
pub use executor::{BulkResult, CascadeExecutor, CascadeOptions, CascadeResult, RestoreResult};
pub use metrics::{CascadeMetrics, CascadeMetricsSummary};
pub use registry::{EntityKind, Registry, RelationshipDefinition};
