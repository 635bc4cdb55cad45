//! Background integrity maintenance: orphaned-reference cleanup, the
//! consistency validator and audit-log retention.

use messaging::{Event, Severity};
use serde::Serialize;

mod orphan;
mod retention;
mod validator;

pub use orphan::{OrphanReport, OrphanScanner};
pub use retention::{AuditRetention, RetentionRunResult};
pub use validator::{CheckResult, IntegrityReport, IntegrityValidator};
pub use validator::{
    ARCHIVAL_CORRECTNESS, AUDIT_ORPHANS, MEMBERSHIP_SYMMETRY, REFERENCE_VALIDITY, SCHEDULE_CONFLICTS,
};

/// One inconsistency found by an integrity routine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub check: String,
    pub collection: String,
    pub document_id: String,
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_id: Option<String>,
    pub severity: Severity,
    pub fixed: bool,
    pub description: String,
}

impl IntegrityIssue {
    pub fn to_event(&self) -> Event {
        Event::IntegrityIssue {
            check: self.check.clone(),
            collection: self.collection.clone(),
            document_id: self.document_id.clone(),
            field: self.field.clone(),
            severity: self.severity,
            fixed: self.fixed,
            description: self.description.clone(),
        }
    }
}
