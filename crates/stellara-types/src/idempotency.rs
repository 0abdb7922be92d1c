//! Idempotency ledger entries.
//!
//! A ledger entry maps a caller's idempotency key to the single physical
//! run that was started for it, and later to that run's terminal outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowOutcome;

/// Result of an atomic reserve-or-fetch on the ledger.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// No live entry existed; the caller now owns the key.
    Reserved,
    /// Another run holds the key and has not finished yet.
    InProgress { workflow_id: Uuid },
    /// A run for this key already finished within the retention window.
    Cached(WorkflowOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    InProgress,
    Completed,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerState::InProgress => "in_progress",
            LedgerState::Completed => "completed",
        }
    }
}

/// A stored ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub idempotency_key: String,
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub state: LedgerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkflowOutcome>,
    pub reserved_at: DateTime<Utc>,
    /// Set when the outcome is stored; in-progress entries never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        workflow_id: Uuid,
        workflow_type: impl Into<String>,
        reserved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            workflow_id,
            workflow_type: workflow_type.into(),
            state: LedgerState::InProgress,
            outcome: None,
            reserved_at,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// What a new submission with this entry's key should observe.
    pub fn to_reservation(&self) -> Reservation {
        match (&self.state, &self.outcome) {
            (LedgerState::Completed, Some(outcome)) => Reservation::Cached(outcome.clone()),
            _ => Reservation::InProgress {
                workflow_id: self.workflow_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_in_progress_entry_never_expires() {
        let entry = LedgerEntry::in_progress("k", Uuid::now_v7(), "transfer", Utc::now());
        assert!(!entry.is_expired(Utc::now() + Duration::days(365)));
        assert!(matches!(entry.to_reservation(), Reservation::InProgress { .. }));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let mut entry = LedgerEntry::in_progress("k", Uuid::now_v7(), "transfer", now);
        entry.expires_at = Some(now);
        assert!(entry.is_expired(now));
        assert!(!entry.is_expired(now - Duration::seconds(1)));
    }
}
