//! Audit log retention.
//!
//! Audit records past the retention window are flagged `archived` so they
//! drop out of default listings. Nothing is ever deleted.

use std::sync::Arc;

use chrono::{DateTime, Months, SecondsFormat, Utc};
use common::store::{Collections, DocumentStore, Filter, Update};
use serde::Serialize;

use crate::audit::AUDIT_COLLECTION;
use crate::error::Result;

/// Result of a retention run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRunResult {
    pub cutoff: DateTime<Utc>,
    pub archived: u64,
}

#[derive(Debug, Clone)]
pub struct AuditRetention {
    store: Arc<dyn DocumentStore>,
    retention_months: u32,
}

impl AuditRetention {
    pub fn new(store: Arc<dyn DocumentStore>, retention_months: u32) -> Self {
        Self {
            store,
            retention_months,
        }
    }

    /// Records with a timestamp before the cutoff are eligible.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_months(Months::new(self.retention_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Flag every unarchived record older than the retention window.
    pub async fn archive(&self, now: DateTime<Utc>) -> Result<RetentionRunResult> {
        let cutoff = self.cutoff(now);
        let outcome = self
            .store
            .update_many(
                AUDIT_COLLECTION,
                &Filter::and([
                    Filter::lt("timestamp", cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)),
                    Filter::ne("archived", true),
                ]),
                &[
                    Update::set("archived", true),
                    Update::set("archivedAt", now.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ],
            )
            .await?;

        tracing::info!(
            cutoff = %cutoff,
            archived = outcome.modified,
            retention_months = self.retention_months,
            "Audit log retention run complete"
        );
        Ok(RetentionRunResult {
            cutoff,
            archived: outcome.modified,
        })
    }
}
