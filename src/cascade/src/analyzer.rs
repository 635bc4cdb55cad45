//! Snapshot & impact analysis.
//!
//! `preview_deletion` is read-only and best-effort: a failing relationship
//! query is reported in its entry instead of aborting the preview.
//! `create_snapshot` runs inside the cascade transaction so the captured
//! documents are exactly the ones the cascade is about to mutate.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::id::EntityId;
use common::store::{Collections, Document, DocumentStore, Filter, FindOptions, StoreError};
use messaging::Severity;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CascadeError, Result};
use crate::registry::{
    CascadeAction, Criticality, EntityKind, FieldKind, Registry, RelationshipDefinition,
};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    /// Classify by reference volume. Any critical reference makes the
    /// impact high regardless of the other counts.
    pub fn classify(critical_total: u64, high_total: u64, total: u64) -> Self {
        if critical_total > 0 || total > 100 {
            ImpactLevel::High
        } else if high_total > 10 || total > 20 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    ActiveEntity,
    AttendanceVolume,
    CriticalData,
    Membership,
    QueryFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub kind: WarningKind,
    pub severity: Severity,
    pub message: String,
    pub affected_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub is_active: bool,
    pub deleted: bool,
}

impl EntitySummary {
    fn from_document(kind: EntityKind, id: EntityId, doc: &Document) -> Self {
        let name = doc
            .get("personalInfo")
            .and_then(|info| info.get("fullName"))
            .or_else(|| doc.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id,
            kind,
            name,
            is_active: doc.get("isActive").and_then(Value::as_bool).unwrap_or(true),
            deleted: doc.get("deleted").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipImpact {
    pub collection: String,
    pub field: String,
    pub field_kind: FieldKind,
    pub action: CascadeAction,
    pub criticality: Criticality,
    pub description: String,
    pub count: u64,
    pub sample_items: Vec<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactReport {
    pub entity_kind: EntityKind,
    pub entity_summary: EntitySummary,
    pub per_relationship_impact: BTreeMap<String, RelationshipImpact>,
    pub relationship_counts: BTreeMap<String, u64>,
    pub total_references: u64,
    pub warnings: Vec<Warning>,
    pub recommended_actions: Vec<String>,
    pub can_delete: bool,
    pub estimated_impact_level: ImpactLevel,
}

/// Read-only deletion preview.
#[derive(Debug, Clone)]
pub struct ImpactAnalyzer {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    sample_size: usize,
}

impl ImpactAnalyzer {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<Registry>, sample_size: usize) -> Self {
        Self {
            store,
            registry,
            sample_size,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn preview_deletion(&self, kind: EntityKind, raw_id: &str) -> Result<ImpactReport> {
        let id = EntityId::parse(raw_id)?;
        let entity = load_entity(self.store.as_ref(), kind, &id).await?;
        let summary = EntitySummary::from_document(kind, id.clone(), &entity);

        let mut impacts = Vec::new();
        for relationship in self.registry.relationships(kind) {
            impacts.push((relationship, self.relationship_impact(relationship, &id).await));
        }

        let total: u64 = impacts.iter().map(|(_, i)| i.count).sum();
        let total_for = |criticality: Criticality| -> u64 {
            impacts
                .iter()
                .filter(|(r, _)| r.criticality == criticality)
                .map(|(_, i)| i.count)
                .sum()
        };
        let critical_total = total_for(Criticality::Critical);
        let high_total = total_for(Criticality::High);
        let attendance_total: u64 = impacts
            .iter()
            .filter(|(r, _)| r.attendance_like)
            .map(|(_, i)| i.count)
            .sum();

        let level = ImpactLevel::classify(critical_total, high_total, total);
        let can_delete = !(critical_total > 0 && level == ImpactLevel::High);
        let warnings = build_warnings(&summary, &impacts, attendance_total);
        let recommended_actions = recommend(&warnings);

        tracing::debug!(
            entity_kind = %kind,
            entity_id = %id,
            total,
            critical_total,
            level = ?level,
            "Computed deletion impact"
        );

        let relationship_counts = impacts
            .iter()
            .map(|(_, i)| (i.collection.clone(), i.count))
            .collect();
        let per_relationship_impact = impacts
            .into_iter()
            .map(|(_, i)| (i.collection.clone(), i))
            .collect();

        Ok(ImpactReport {
            entity_kind: kind,
            entity_summary: summary,
            per_relationship_impact,
            relationship_counts,
            total_references: total,
            warnings,
            recommended_actions,
            can_delete,
            estimated_impact_level: level,
        })
    }

    async fn relationship_impact(
        &self,
        relationship: &RelationshipDefinition,
        id: &EntityId,
    ) -> RelationshipImpact {
        let mut impact = RelationshipImpact {
            collection: relationship.owner_collection.clone(),
            field: relationship.field_path(),
            field_kind: relationship.accessor.kind(),
            action: relationship.action,
            criticality: relationship.criticality,
            description: relationship.impact_description.clone(),
            count: 0,
            sample_items: Vec::new(),
            error: None,
        };

        let filter = relationship.reference_filter(id.as_str());
        let collection = relationship.owner_collection.as_str();
        let queried = async {
            let count = self.store.count(collection, &filter).await?;
            let samples = if count == 0 {
                Vec::new()
            } else {
                let options = FindOptions::limit(self.sample_size)
                    .with_projection([relationship.root_field()]);
                self.store.find(collection, &filter, options).await?
            };
            Ok::<_, StoreError>((count, samples))
        }
        .await;

        match queried {
            Ok((count, samples)) => {
                impact.count = count;
                impact.sample_items = samples;
            }
            Err(e) => {
                tracing::warn!(
                    collection,
                    field = %impact.field,
                    entity_id = %id,
                    "Impact query failed: {e}"
                );
                impact.error = Some(e.to_string());
            }
        }
        impact
    }
}

fn build_warnings(
    summary: &EntitySummary,
    impacts: &[(&RelationshipDefinition, RelationshipImpact)],
    attendance_total: u64,
) -> Vec<Warning> {
    let mut warnings = Vec::new();

    if summary.is_active {
        warnings.push(Warning {
            kind: WarningKind::ActiveEntity,
            severity: Severity::Info,
            message: format!(
                "The {} is still active; consider deactivating it before deletion",
                summary.kind
            ),
            affected_count: 1,
            collection: None,
        });
    }

    if attendance_total > 50 {
        warnings.push(Warning {
            kind: WarningKind::AttendanceVolume,
            severity: Severity::High,
            message: format!("{attendance_total} attendance records will be archived"),
            affected_count: attendance_total,
            collection: None,
        });
    }

    for (relationship, impact) in impacts {
        if relationship.criticality == Criticality::Critical && impact.count > 0 {
            warnings.push(Warning {
                kind: WarningKind::CriticalData,
                severity: Severity::Critical,
                message: format!(
                    "{} critical {} record(s) reference this {}",
                    impact.count, impact.collection, summary.kind
                ),
                affected_count: impact.count,
                collection: Some(impact.collection.clone()),
            });
        }
    }

    for (relationship, impact) in impacts {
        if relationship.action == CascadeAction::RemoveReference
            && relationship.criticality >= Criticality::Medium
            && impact.count > 0
        {
            warnings.push(Warning {
                kind: WarningKind::Membership,
                severity: Severity::Medium,
                message: format!(
                    "The {} will be removed from {} {} document(s)",
                    summary.kind, impact.count, impact.collection
                ),
                affected_count: impact.count,
                collection: Some(impact.collection.clone()),
            });
        }
    }

    for (_, impact) in impacts {
        if let Some(error) = &impact.error {
            warnings.push(Warning {
                kind: WarningKind::QueryFailed,
                severity: Severity::Medium,
                message: format!("Could not analyse {}: {error}", impact.collection),
                affected_count: 0,
                collection: Some(impact.collection.clone()),
            });
        }
    }

    warnings
}

fn recommend(warnings: &[Warning]) -> Vec<String> {
    let mut actions: Vec<String> = Vec::new();
    for warning in warnings {
        let collection = warning.collection.as_deref().unwrap_or_default();
        let action = match warning.kind {
            WarningKind::ActiveEntity => "Deactivate the entity first and confirm no activity is ongoing".to_string(),
            WarningKind::AttendanceVolume => "Export attendance history before deleting".to_string(),
            WarningKind::CriticalData => format!(
                "Review {collection} records; keep preserveAcademic enabled or use an authorised hard delete"
            ),
            WarningKind::Membership => format!("Notify owners of affected {collection} documents"),
            WarningKind::QueryFailed => format!("Retry the preview; the {collection} impact is incomplete"),
        };
        if !actions.contains(&action) {
            actions.push(action);
        }
    }
    actions
}

pub(crate) async fn load_entity<C: Collections + ?Sized>(
    store: &C,
    kind: EntityKind,
    id: &EntityId,
) -> Result<Document> {
    store
        .find_one(kind.collection(), &Filter::id(id))
        .await?
        .ok_or_else(|| CascadeError::EntityNotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        })
}

/// Capture the entity and every live document referencing it, reading
/// through `tx` so the view matches what the cascade mutates.
pub async fn create_snapshot<C: Collections + ?Sized>(
    tx: &C,
    registry: &Registry,
    kind: EntityKind,
    id: &EntityId,
    captured_at: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<Snapshot> {
    let entity_document = load_entity(tx, kind, id).await?;

    let mut related: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    for relationship in registry.relationships(kind) {
        let docs = tx
            .find(
                &relationship.owner_collection,
                &relationship.reference_filter(id.as_str()),
                FindOptions::default(),
            )
            .await?;
        related
            .entry(relationship.owner_collection.clone())
            .or_default()
            .extend(docs);
    }

    Ok(Snapshot {
        id: EntityId::generate(),
        entity_kind: kind,
        entity_id: id.clone(),
        entity_document,
        related_documents_by_collection: related,
        captured_at,
        expires_at: captured_at + ttl,
        used: false,
        used_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::store::MemoryStore;
    use common::testing::fixtures::{self, seed_student_scenario};

    fn analyzer(store: Arc<MemoryStore>) -> ImpactAnalyzer {
        ImpactAnalyzer::new(store, Arc::new(Registry::conservatory()), 3)
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(ImpactLevel::classify(0, 15, 5), ImpactLevel::Medium);
        assert_eq!(ImpactLevel::classify(1, 0, 1), ImpactLevel::High);
        assert_eq!(ImpactLevel::classify(0, 0, 101), ImpactLevel::High);
        assert_eq!(ImpactLevel::classify(0, 0, 21), ImpactLevel::Medium);
        assert_eq!(ImpactLevel::classify(0, 10, 20), ImpactLevel::Low);
    }

    #[tokio::test]
    async fn test_preview_student_scenario() {
        let store = Arc::new(MemoryStore::new());
        let scenario = seed_student_scenario(store.as_ref()).await.unwrap();

        let report = analyzer(store)
            .preview_deletion(EntityKind::Student, scenario.student.as_str())
            .await
            .unwrap();

        assert!(!report.can_delete);
        assert_eq!(report.estimated_impact_level, ImpactLevel::High);
        assert_eq!(report.total_references, 6);
        assert_eq!(report.relationship_counts["orchestra"], 2);
        assert_eq!(report.relationship_counts["activity_attendance"], 3);
        assert_eq!(report.relationship_counts["bagrut"], 1);
        assert_eq!(report.relationship_counts["teacher"], 0);

        let kinds: Vec<WarningKind> = report.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::ActiveEntity,
                WarningKind::CriticalData,
                WarningKind::Membership
            ]
        );
        assert_eq!(report.recommended_actions.len(), 3);

        let samples = &report.per_relationship_impact["orchestra"].sample_items;
        assert_eq!(samples.len(), 2);
        assert!(samples[0].contains_key("memberIds"));
        assert!(!samples[0].contains_key("name"));
    }

    #[tokio::test]
    async fn test_preview_samples_are_bounded() {
        let store = Arc::new(MemoryStore::new());
        let student = EntityId::generate();
        store
            .insert_one("student", fixtures::student(&student, "Yael Bar"))
            .await
            .unwrap();
        for _ in 0..60 {
            store
                .insert_one(
                    "activity_attendance",
                    fixtures::attendance(&EntityId::generate(), &student, "theory"),
                )
                .await
                .unwrap();
        }

        let report = analyzer(store)
            .preview_deletion(EntityKind::Student, student.as_str())
            .await
            .unwrap();
        let attendance = &report.per_relationship_impact["activity_attendance"];
        assert_eq!(attendance.count, 60);
        assert_eq!(attendance.sample_items.len(), 3);
        assert_eq!(report.estimated_impact_level, ImpactLevel::Medium);
        assert!(report.can_delete);
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.kind == WarningKind::AttendanceVolume && w.affected_count == 60)
        );
    }

    #[tokio::test]
    async fn test_preview_rejects_bad_ids() {
        let store = Arc::new(MemoryStore::new());
        let analyzer = analyzer(store);

        let err = analyzer
            .preview_deletion(EntityKind::Student, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidIdentifier(_)));

        let err = analyzer
            .preview_deletion(EntityKind::Student, EntityId::generate().as_str())
            .await
            .unwrap_err();
        assert!(matches!(err, CascadeError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_per_relationship() {
        let store = Arc::new(MemoryStore::new());
        let scenario = seed_student_scenario(store.as_ref()).await.unwrap();
        store.fail_reads_from("bagrut");

        let report = analyzer(store.clone())
            .preview_deletion(EntityKind::Student, scenario.student.as_str())
            .await
            .unwrap();

        let bagrut = &report.per_relationship_impact["bagrut"];
        assert_eq!(bagrut.count, 0);
        assert!(bagrut.error.is_some());
        assert_eq!(report.relationship_counts["orchestra"], 2);
        assert_eq!(
            report.warnings.last().map(|w| w.kind),
            Some(WarningKind::QueryFailed)
        );
    }

    #[tokio::test]
    async fn test_inactive_entity_has_no_active_warning() {
        let store = Arc::new(MemoryStore::new());
        let student = EntityId::generate();
        let mut doc = fixtures::student(&student, "Dana Shir");
        doc.insert("isActive".to_string(), Value::Bool(false));
        store.insert_one("student", doc).await.unwrap();

        let report = analyzer(store)
            .preview_deletion(EntityKind::Student, student.as_str())
            .await
            .unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.estimated_impact_level, ImpactLevel::Low);
        assert!(!report.entity_summary.is_active);
    }

    #[tokio::test]
    async fn test_snapshot_captures_full_documents() {
        let store = MemoryStore::new();
        let scenario = seed_student_scenario(&store).await.unwrap();
        let registry = Registry::conservatory();
        let now = Utc::now();

        let snapshot = create_snapshot(
            &store,
            &registry,
            EntityKind::Student,
            &scenario.student,
            now,
            chrono::Duration::days(30),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.related("orchestra").len(), 2);
        assert_eq!(snapshot.related("activity_attendance").len(), 3);
        assert_eq!(snapshot.related("bagrut").len(), 1);
        assert!(snapshot.related("teacher").is_empty());
        assert_eq!(snapshot.related_count(), 6);
        assert!(snapshot.related("orchestra")[0].contains_key("name"));
        assert_eq!(snapshot.expires_at, now + chrono::Duration::days(30));
    }
}
