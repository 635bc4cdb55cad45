//! Orphaned reference detection and cleanup.
//!
//! A reference is orphaned when the entity it points at no longer exists or
//! has been deactivated. Detection walks every registered relationship, so
//! the scanner and the cascade executor agree on what "references a student"
//! means.
//!
//! Cleanup never erases history. Holders of history or academic records are
//! archived with reason `orphan_cleanup` and keep the id; other holders have
//! the dangling id detached with the same accessor operations the cascade
//! uses. Failed writes are kept in the report, unfixed and escalated to high
//! severity.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use common::store::{Collections, DocumentStore, Filter, FindOptions, Update, document_id};
use messaging::{Event, EventSink, NullSink, Severity};
use serde::Serialize;

use super::IntegrityIssue;
use crate::error::Result;
use crate::registry::{CascadeAction, EntityKind, Registry, RelationshipDefinition};

pub(crate) const CHECK_NAME: &str = "orphaned_references";

/// `archivedReason` of holders archived because their target vanished.
pub const ORPHAN_ARCHIVE_REASON: &str = "orphan_cleanup";

/// A dangling reference found by detection.
#[derive(Debug, Clone)]
struct OrphanCandidate<'a> {
    relationship: &'a RelationshipDefinition,
    target_kind: EntityKind,
    document_id: String,
    missing_id: String,
}

impl OrphanCandidate<'_> {
    fn issue(&self, severity: Severity, fixed: bool) -> IntegrityIssue {
        IntegrityIssue {
            check: CHECK_NAME.to_string(),
            collection: self.relationship.owner_collection.clone(),
            document_id: self.document_id.clone(),
            field: self.relationship.field_path(),
            referenced_id: Some(self.missing_id.clone()),
            severity,
            fixed,
            description: format!(
                "References missing or inactive {} '{}'",
                self.target_kind, self.missing_id
            ),
        }
    }
}

/// Outcome of an orphan scan.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    pub dry_run: bool,
    pub relationships_scanned: usize,
    pub documents_scanned: usize,
    pub orphans: Vec<IntegrityIssue>,
    pub fixed: usize,
    pub failed: usize,
}

impl OrphanReport {
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}

#[derive(Clone)]
pub struct OrphanScanner {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    events: Arc<dyn EventSink>,
    batch_size: usize,
}

impl std::fmt::Debug for OrphanScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanScanner")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl OrphanScanner {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<Registry>, batch_size: usize) -> Self {
        Self {
            store,
            registry,
            events: Arc::new(NullSink),
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Find orphaned references and, unless `dry_run`, detach them.
    pub async fn scan(&self, dry_run: bool) -> Result<OrphanReport> {
        let mut report = OrphanReport {
            dry_run,
            ..OrphanReport::default()
        };
        let candidates = self.detect(&mut report).await?;

        if candidates.is_empty() {
            tracing::info!(
                documents_scanned = report.documents_scanned,
                "No orphaned references found"
            );
        }

        let mut archived = HashSet::new();
        let total_batches = candidates.len().div_ceil(self.batch_size);
        for (batch_idx, batch) in candidates.chunks(self.batch_size).enumerate() {
            tracing::debug!(
                batch = batch_idx + 1,
                total_batches,
                batch_size = batch.len(),
                dry_run,
                "Processing orphan batch"
            );
            for candidate in batch {
                let issue = if dry_run {
                    tracing::info!(
                        collection = %candidate.relationship.owner_collection,
                        document_id = %candidate.document_id,
                        missing_id = %candidate.missing_id,
                        "[DRY-RUN] Would clean up orphaned reference"
                    );
                    candidate.issue(Severity::Medium, false)
                } else {
                    self.detach(candidate, &mut archived, &mut report).await
                };
                self.events.publish(issue.to_event());
                report.orphans.push(issue);
            }
        }

        self.events.publish(Event::IntegrityComplete {
            checks: 1,
            issues: report.orphans.len(),
            fixed: report.fixed,
        });
        tracing::info!(
            orphans = report.orphans.len(),
            fixed = report.fixed,
            failed = report.failed,
            dry_run,
            "Orphaned reference scan complete"
        );
        Ok(report)
    }

    /// Report orphans without detaching them.
    pub async fn find_orphans(&self) -> Result<Vec<IntegrityIssue>> {
        let mut report = OrphanReport::default();
        let candidates = self.detect(&mut report).await?;
        Ok(candidates
            .iter()
            .map(|c| c.issue(Severity::Medium, false))
            .collect())
    }

    async fn detach(
        &self,
        candidate: &OrphanCandidate<'_>,
        archived: &mut HashSet<(String, String)>,
        report: &mut OrphanReport,
    ) -> IntegrityIssue {
        let relationship = candidate.relationship;
        let holder = (
            relationship.owner_collection.clone(),
            candidate.document_id.clone(),
        );
        let archives = relationship.action != CascadeAction::RemoveReference;

        // A holder with several dangling ids is archived once.
        if archives && archived.contains(&holder) {
            report.fixed += 1;
            return candidate.issue(Severity::Medium, true);
        }

        let updates = if archives {
            let mut updates = vec![
                Update::set("archived", true),
                Update::set(
                    "archivedAt",
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                Update::set("archivedReason", ORPHAN_ARCHIVE_REASON),
            ];
            if relationship.action == CascadeAction::ArchiveRecord {
                updates.push(Update::set("isActive", false));
            }
            updates
        } else {
            relationship.accessor.detach(&candidate.missing_id)
        };

        let outcome = self
            .store
            .update_one(
                &relationship.owner_collection,
                &Filter::id(candidate.document_id.as_str()),
                &updates,
            )
            .await;

        match outcome {
            Ok(outcome) if outcome.modified > 0 => {
                report.fixed += 1;
                if archives {
                    archived.insert(holder);
                }
                tracing::info!(
                    collection = %relationship.owner_collection,
                    document_id = %candidate.document_id,
                    missing_id = %candidate.missing_id,
                    archived = archives,
                    "Cleaned up orphaned reference"
                );
                candidate.issue(Severity::Medium, true)
            }
            Ok(outcome) => {
                tracing::debug!(
                    collection = %relationship.owner_collection,
                    document_id = %candidate.document_id,
                    matched = outcome.matched,
                    "Orphaned reference left unchanged"
                );
                candidate.issue(Severity::Medium, false)
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    collection = %relationship.owner_collection,
                    document_id = %candidate.document_id,
                    missing_id = %candidate.missing_id,
                    "Failed to clean up orphaned reference: {e}"
                );
                candidate.issue(Severity::High, false)
            }
        }
    }

    async fn detect(&self, report: &mut OrphanReport) -> Result<Vec<OrphanCandidate<'_>>> {
        let relationships: Vec<_> = self.registry.all().collect();
        let mut live: HashMap<EntityKind, HashSet<String>> = HashMap::new();
        let mut candidates = Vec::new();

        for (index, &(target_kind, relationship)) in relationships.iter().enumerate() {
            if !live.contains_key(&target_kind) {
                let ids = self.live_ids(target_kind).await?;
                live.insert(target_kind, ids);
            }
            let live_ids = &live[&target_kind];

            let holders = self
                .store
                .find(
                    &relationship.owner_collection,
                    &Filter::and([
                        relationship.accessor.present_filter(),
                        Filter::ne("archived", true),
                        Filter::ne("deleted", true),
                    ]),
                    FindOptions::default().with_projection([relationship.root_field()]),
                )
                .await?;

            report.relationships_scanned += 1;
            report.documents_scanned += holders.len();
            for holder in &holders {
                let holder_id = document_id(holder)?;
                let dangling: BTreeSet<String> = relationship
                    .accessor
                    .referenced_ids(holder)
                    .into_iter()
                    .filter(|id| !live_ids.contains(id))
                    .collect();
                for missing_id in dangling {
                    candidates.push(OrphanCandidate {
                        relationship,
                        target_kind,
                        document_id: holder_id.to_string(),
                        missing_id,
                    });
                }
            }

            self.events.publish(Event::IntegrityProgress {
                check: CHECK_NAME.to_string(),
                completed: index + 1,
                total: relationships.len(),
            });
        }

        Ok(candidates)
    }

    /// Ids of entities of `kind` that are neither deactivated nor deleted.
    async fn live_ids(&self, kind: EntityKind) -> Result<HashSet<String>> {
        let docs = self
            .store
            .find(
                kind.collection(),
                &Filter::and([Filter::ne("isActive", false), Filter::ne("deleted", true)]),
                FindOptions::default().with_projection(["_id"]),
            )
            .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| document_id(doc).ok())
            .map(str::to_string)
            .collect())
    }
}
