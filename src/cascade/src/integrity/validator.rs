//! Named referential-consistency checks.
//!
//! Checks are read-only. A check whose queries fail is reported with its
//! error and the remaining checks still run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use common::store::{Collections, Document, DocumentStore, Filter, FindOptions, document_id};
use messaging::{Event, EventSink, NullSink, Severity};
use serde::Serialize;
use serde_json::Value;

use super::IntegrityIssue;
use super::orphan::OrphanScanner;
use crate::audit::AUDIT_COLLECTION;
use crate::error::Result;
use crate::registry::{CascadeAction, Registry};
use crate::snapshot::SNAPSHOT_COLLECTION;

pub const REFERENCE_VALIDITY: &str = "reference_validity";
pub const SCHEDULE_CONFLICTS: &str = "schedule_conflicts";
pub const MEMBERSHIP_SYMMETRY: &str = "membership_symmetry";
pub const AUDIT_ORPHANS: &str = "audit_orphans";
pub const ARCHIVAL_CORRECTNESS: &str = "archival_correctness";

const CHECKS: [&str; 5] = [
    REFERENCE_VALIDITY,
    SCHEDULE_CONFLICTS,
    MEMBERSHIP_SYMMETRY,
    AUDIT_ORPHANS,
    ARCHIVAL_CORRECTNESS,
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub issues: Vec<IntegrityIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub checks: Vec<CheckResult>,
    pub total_issues: usize,
}

impl IntegrityReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

#[derive(Clone)]
pub struct IntegrityValidator {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    orphans: OrphanScanner,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for IntegrityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityValidator").finish_non_exhaustive()
    }
}

fn issue(
    check: &str,
    collection: &str,
    doc: &Document,
    field: &str,
    severity: Severity,
    description: String,
) -> IntegrityIssue {
    IntegrityIssue {
        check: check.to_string(),
        collection: collection.to_string(),
        document_id: document_id(doc).unwrap_or_default().to_string(),
        field: field.to_string(),
        referenced_id: None,
        severity,
        fixed: false,
        description,
    }
}

/// Minutes since midnight for an `HH:MM` time.
fn minutes(raw: &str) -> Option<u32> {
    let (hours, mins) = raw.split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let mins: u32 = mins.trim().parse().ok()?;
    (hours < 24 && mins < 60).then_some(hours * 60 + mins)
}

fn string_ids(value: Option<&Value>) -> HashSet<String> {
    value
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn live() -> Filter {
    Filter::and([Filter::ne("isActive", false), Filter::ne("deleted", true)])
}

impl IntegrityValidator {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<Registry>) -> Self {
        Self {
            orphans: OrphanScanner::new(store.clone(), registry.clone(), usize::MAX),
            store,
            registry,
            events: Arc::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Run every check.
    pub async fn run(&self) -> IntegrityReport {
        let mut checks = Vec::with_capacity(CHECKS.len());
        for (index, name) in CHECKS.iter().enumerate() {
            let outcome = match *name {
                REFERENCE_VALIDITY => self.orphans.find_orphans().await,
                SCHEDULE_CONFLICTS => self.schedule_conflicts().await,
                MEMBERSHIP_SYMMETRY => self.membership_symmetry().await,
                AUDIT_ORPHANS => self.audit_orphans().await,
                _ => self.archival_correctness().await,
            };

            let result = match outcome {
                Ok(mut issues) => {
                    for issue in &mut issues {
                        issue.check = name.to_string();
                        self.events.publish(issue.to_event());
                    }
                    let recommendation = (!issues.is_empty()).then(|| recommend(name).to_string());
                    CheckResult {
                        name: name.to_string(),
                        issues,
                        recommendation,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(check = name, "Integrity check failed: {e}");
                    CheckResult {
                        name: name.to_string(),
                        issues: Vec::new(),
                        recommendation: Some("Re-run validation once storage is healthy".to_string()),
                        error: Some(e.to_string()),
                    }
                }
            };

            tracing::info!(check = name, issues = result.issue_count(), "Integrity check finished");
            self.events.publish(Event::IntegrityProgress {
                check: name.to_string(),
                completed: index + 1,
                total: CHECKS.len(),
            });
            checks.push(result);
        }

        let total_issues = checks.iter().map(CheckResult::issue_count).sum();
        self.events.publish(Event::IntegrityComplete {
            checks: checks.len(),
            issues: total_issues,
            fixed: 0,
        });
        IntegrityReport {
            checks,
            total_issues,
        }
    }

    /// Overlapping time blocks of one teacher on the same day.
    async fn schedule_conflicts(&self) -> Result<Vec<IntegrityIssue>> {
        let teachers = self
            .store
            .find("teacher", &live(), FindOptions::default())
            .await?;

        let mut issues = Vec::new();
        for teacher in &teachers {
            let Some(blocks) = teacher
                .get("teaching")
                .and_then(|t| t.get("timeBlocks"))
                .and_then(Value::as_array)
            else {
                continue;
            };

            let mut by_day: HashMap<&str, Vec<(u32, u32, &Value)>> = HashMap::new();
            for block in blocks {
                let day = block.get("day").and_then(Value::as_str);
                let start = block.get("startTime").and_then(Value::as_str).and_then(minutes);
                let end = block.get("endTime").and_then(Value::as_str).and_then(minutes);
                if let (Some(day), Some(start), Some(end)) = (day, start, end) {
                    by_day.entry(day).or_default().push((start, end, block));
                }
            }

            for (day, mut slots) in by_day {
                slots.sort_by_key(|(start, _, _)| *start);
                for (i, (_, first_end, first)) in slots.iter().enumerate() {
                    for (second_start, _, second) in &slots[i + 1..] {
                        if second_start >= first_end {
                            break;
                        }
                        issues.push(issue(
                            SCHEDULE_CONFLICTS,
                            "teacher",
                            teacher,
                            "teaching.timeBlocks",
                            Severity::Medium,
                            format!(
                                "Time blocks {} and {} overlap on {day}",
                                first.get("_id").unwrap_or(&Value::Null),
                                second.get("_id").unwrap_or(&Value::Null)
                            ),
                        ));
                    }
                }
            }
        }
        Ok(issues)
    }

    /// Orchestra membership and student enrollment must mirror each other.
    async fn membership_symmetry(&self) -> Result<Vec<IntegrityIssue>> {
        let orchestras = self
            .store
            .find("orchestra", &live(), FindOptions::default())
            .await?;
        let students = self
            .store
            .find("student", &live(), FindOptions::default())
            .await?;

        let enrollments: HashMap<&str, HashSet<String>> = students
            .iter()
            .filter_map(|s| {
                let id = document_id(s).ok()?;
                let orchestra_ids =
                    string_ids(s.get("enrollments").and_then(|e| e.get("orchestraIds")));
                Some((id, orchestra_ids))
            })
            .collect();
        let members: HashMap<&str, HashSet<String>> = orchestras
            .iter()
            .filter_map(|o| Some((document_id(o).ok()?, string_ids(o.get("memberIds")))))
            .collect();

        let mut issues = Vec::new();
        for orchestra in &orchestras {
            let Ok(orchestra_id) = document_id(orchestra) else {
                continue;
            };
            let member_ids: BTreeSet<&String> = members[orchestra_id].iter().collect();
            for member in member_ids {
                if let Some(enrolled) = enrollments.get(member.as_str()) {
                    if !enrolled.contains(orchestra_id) {
                        issues.push(issue(
                            MEMBERSHIP_SYMMETRY,
                            "orchestra",
                            orchestra,
                            "memberIds",
                            Severity::Low,
                            format!("Member {member} is not enrolled in this orchestra"),
                        ));
                    }
                }
            }
        }

        for student in &students {
            let Ok(student_id) = document_id(student) else {
                continue;
            };
            let enrolled: BTreeSet<&String> = enrollments[student_id].iter().collect();
            for orchestra_id in enrolled {
                if let Some(member_ids) = members.get(orchestra_id.as_str()) {
                    if !member_ids.contains(student_id) {
                        issues.push(issue(
                            MEMBERSHIP_SYMMETRY,
                            "student",
                            student,
                            "enrollments.orchestraIds",
                            Severity::Low,
                            format!("Enrolled in orchestra {orchestra_id} but not listed as a member"),
                        ));
                    }
                }
            }
        }
        Ok(issues)
    }

    /// Cascade audit records whose snapshot no longer exists.
    async fn audit_orphans(&self) -> Result<Vec<IntegrityIssue>> {
        let records = self
            .store
            .find(
                AUDIT_COLLECTION,
                &Filter::and([
                    Filter::eq("deletionType", "cascade_cleanup"),
                    Filter::ne("archived", true),
                ]),
                FindOptions::default().with_projection(["snapshotRef"]),
            )
            .await?;
        let snapshots: HashSet<String> = self
            .store
            .find(
                SNAPSHOT_COLLECTION,
                &Filter::All,
                FindOptions::default().with_projection(["_id"]),
            )
            .await?
            .iter()
            .filter_map(|doc| document_id(doc).ok())
            .map(str::to_string)
            .collect();

        let mut issues = Vec::new();
        for record in &records {
            match record.get("snapshotRef").and_then(Value::as_str) {
                Some(snapshot) if snapshots.contains(snapshot) => {}
                reference => issues.push(issue(
                    AUDIT_ORPHANS,
                    AUDIT_COLLECTION,
                    record,
                    "snapshotRef",
                    Severity::Low,
                    match reference {
                        Some(snapshot) => format!("Snapshot {snapshot} no longer exists"),
                        None => "Audit record has no snapshot".to_string(),
                    },
                )),
            }
        }
        Ok(issues)
    }

    /// Archived documents must carry their archive metadata, and archived
    /// academic records must be inactive.
    async fn archival_correctness(&self) -> Result<Vec<IntegrityIssue>> {
        let mut collections: Vec<(&str, bool)> = Vec::new();
        for (_, relationship) in self.registry.all() {
            let record = match relationship.action {
                CascadeAction::RemoveReference => continue,
                CascadeAction::PreserveHistory => false,
                CascadeAction::ArchiveRecord => true,
            };
            if !collections.iter().any(|(c, _)| *c == relationship.owner_collection) {
                collections.push((relationship.owner_collection.as_str(), record));
            }
        }

        let mut issues = Vec::new();
        for (collection, academic) in collections {
            let archived = self
                .store
                .find(collection, &Filter::eq("archived", true), FindOptions::default())
                .await?;
            for doc in &archived {
                let missing: Vec<&str> = ["archivedAt", "archivedReason"]
                    .into_iter()
                    .filter(|field| doc.get(*field).is_none_or(Value::is_null))
                    .collect();
                if !missing.is_empty() {
                    issues.push(issue(
                        ARCHIVAL_CORRECTNESS,
                        collection,
                        doc,
                        "archived",
                        Severity::Low,
                        format!("Archived without {}", missing.join(", ")),
                    ));
                }
                if academic && doc.get("isActive").and_then(Value::as_bool) == Some(true) {
                    issues.push(issue(
                        ARCHIVAL_CORRECTNESS,
                        collection,
                        doc,
                        "isActive",
                        Severity::Medium,
                        "Archived academic record is still active".to_string(),
                    ));
                }
            }
        }
        Ok(issues)
    }
}

fn recommend(check: &str) -> &'static str {
    match check {
        REFERENCE_VALIDITY => "Run the orphaned reference cleanup job",
        SCHEDULE_CONFLICTS => "Reassign or shorten the overlapping time blocks",
        MEMBERSHIP_SYMMETRY => "Re-sync orchestra member lists with student enrollments",
        AUDIT_ORPHANS => "Expired snapshots can no longer be rolled back; archive the audit records",
        _ => "Re-archive the listed records so archive metadata is complete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::id::EntityId;
    use common::store::MemoryStore;
    use common::testing::fixtures::{self, doc, seed_student_scenario};
    use serde_json::json;

    fn validator(store: Arc<MemoryStore>) -> IntegrityValidator {
        IntegrityValidator::new(store, Arc::new(Registry::conservatory()))
    }

    #[tokio::test]
    async fn test_clean_scenario_has_no_issues() {
        let store = Arc::new(MemoryStore::new());
        seed_student_scenario(store.as_ref()).await.unwrap();
        let report = validator(store).run().await;
        assert_eq!(report.checks.len(), 5);
        assert_eq!(report.total_issues, 0);
        assert!(report.checks.iter().all(|c| c.recommendation.is_none()));
    }

    #[tokio::test]
    async fn test_detects_schedule_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_one(
                "teacher",
                doc(json!({
                    "_id": EntityId::generate(),
                    "isActive": true,
                    "teaching": {"timeBlocks": [
                        {"_id": "b1", "day": "Sunday", "startTime": "14:00", "endTime": "16:00"},
                        {"_id": "b2", "day": "Sunday", "startTime": "15:30", "endTime": "17:00"},
                        {"_id": "b3", "day": "Monday", "startTime": "15:30", "endTime": "17:00"},
                        {"_id": "b4", "day": "Sunday", "startTime": "17:00", "endTime": "18:00"}
                    ]}
                })),
            )
            .await
            .unwrap();

        let report = validator(store).run().await;
        let conflicts = report.check(SCHEDULE_CONFLICTS).unwrap();
        assert_eq!(conflicts.issue_count(), 1);
        assert!(conflicts.recommendation.is_some());
    }

    #[tokio::test]
    async fn test_detects_asymmetric_membership() {
        let store = Arc::new(MemoryStore::new());
        let scenario = seed_student_scenario(store.as_ref()).await.unwrap();
        let report = validator(store.clone()).run().await;
        assert_eq!(report.check(MEMBERSHIP_SYMMETRY).unwrap().issue_count(), 0);

        let loner = EntityId::generate();
        let mut student = fixtures::student(&loner, "Tal Or");
        student.insert(
            "enrollments".to_string(),
            json!({"orchestraIds": [scenario.orchestras[0]]}),
        );
        store.insert_one("student", student).await.unwrap();

        let report = validator(store).run().await;
        let symmetry = report.check(MEMBERSHIP_SYMMETRY).unwrap();
        assert_eq!(symmetry.issue_count(), 1);
        assert_eq!(symmetry.issues[0].document_id, loner.as_str());
    }

    #[tokio::test]
    async fn test_detects_archival_and_audit_problems() {
        let store = Arc::new(MemoryStore::new());
        let mut record = fixtures::bagrut(&EntityId::generate(), &EntityId::generate());
        record.insert("archived".to_string(), json!(true));
        store.insert_one("bagrut", record).await.unwrap();
        store
            .insert_one(
                AUDIT_COLLECTION,
                doc(json!({
                    "_id": EntityId::generate(),
                    "deletionType": "cascade_cleanup",
                    "snapshotRef": EntityId::generate()
                })),
            )
            .await
            .unwrap();

        let report = validator(store).run().await;
        assert_eq!(report.check(ARCHIVAL_CORRECTNESS).unwrap().issue_count(), 2);
        assert_eq!(report.check(AUDIT_ORPHANS).unwrap().issue_count(), 1);
        // Archived records are not live references
        assert_eq!(report.check(REFERENCE_VALIDITY).unwrap().issue_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_check_does_not_stop_the_suite() {
        let store = Arc::new(MemoryStore::new());
        store.fail_reads_from(AUDIT_COLLECTION);
        let report = validator(store).run().await;
        assert_eq!(report.checks.len(), 5);
        assert!(report.check(AUDIT_ORPHANS).unwrap().error.is_some());
        assert!(report.check(ARCHIVAL_CORRECTNESS).unwrap().error.is_none());
    }

    #[test]
    fn test_minutes() {
        assert_eq!(minutes("14:30"), Some(870));
        assert_eq!(minutes("24:00"), None);
        assert_eq!(minutes("noon"), None);
    }
}
