//! In-memory idempotency ledger and idempotency key derivation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use sha2::{Digest, Sha256};
use stellara_types::error::RepositoryError;
use stellara_types::idempotency::{LedgerEntry, LedgerState, Reservation};
use stellara_types::workflow::WorkflowOutcome;
use uuid::Uuid;

use crate::repository::idempotency::IdempotencyLedger;

/// Derive an idempotency key for a request that did not supply one.
///
/// Hex SHA-256 over the workflow type, a NUL separator, and the compact
/// JSON encoding of the input. `serde_json` objects are key-ordered, so
/// logically equal inputs hash the same regardless of field order.
pub fn derive_idempotency_key(workflow_type: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `IdempotencyLedger` backed by a `DashMap`.
///
/// Reserve-or-fetch goes through the map's entry API, which holds the
/// shard write lock for the key, so two concurrent submissions can never
/// both observe `Reserved`.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdempotencyLedger for InMemoryLedger {
    async fn reserve_or_fetch(
        &self,
        key: &str,
        workflow_id: Uuid,
        workflow_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation, RepositoryError> {
        let fresh = || LedgerEntry::in_progress(key, workflow_id, workflow_type, now);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(fresh());
                    Ok(Reservation::Reserved)
                } else {
                    Ok(slot.get().to_reservation())
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh());
                Ok(Reservation::Reserved)
            }
        }
    }

    async fn complete(
        &self,
        key: &str,
        outcome: &WorkflowOutcome,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut entry = self.entries.get_mut(key).ok_or(RepositoryError::NotFound)?;
        if entry.workflow_id != outcome.workflow_id {
            return Err(RepositoryError::Conflict(format!(
                "key '{key}' is held by run {}",
                entry.workflow_id
            )));
        }
        entry.state = LedgerState::Completed;
        entry.outcome = Some(outcome.clone());
        entry.expires_at = Some(expires_at);
        Ok(())
    }

    async fn release(&self, key: &str, workflow_id: Uuid) -> Result<bool, RepositoryError> {
        let removed = self.entries.remove_if(key, |_, entry| {
            entry.workflow_id == workflow_id && entry.state == LedgerState::InProgress
        });
        Ok(removed.is_some())
    }

    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, RepositoryError> {
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone()))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;
    use stellara_types::workflow::WorkflowRunStatus;

    fn outcome(workflow_id: Uuid, key: &str) -> WorkflowOutcome {
        WorkflowOutcome {
            workflow_id,
            workflow_type: "booking".to_string(),
            idempotency_key: key.to_string(),
            status: WorkflowRunStatus::Completed,
            result: Some(json!({"ok": true})),
            error: None,
            compensation_error: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_derived_key_ignores_field_order() {
        let a = derive_idempotency_key("booking", &json!({"a": 1, "b": [1, 2]}));
        let b = derive_idempotency_key("booking", &json!({"b": [1, 2], "a": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, derive_idempotency_key("refund", &json!({"a": 1, "b": [1, 2]})));
    }

    #[tokio::test]
    async fn test_second_reservation_sees_in_progress() {
        let ledger = InMemoryLedger::new();
        let first = Uuid::now_v7();
        let now = Utc::now();

        let r = ledger.reserve_or_fetch("k", first, "booking", now).await.unwrap();
        assert!(matches!(r, Reservation::Reserved));

        let r = ledger
            .reserve_or_fetch("k", Uuid::now_v7(), "booking", now)
            .await
            .unwrap();
        assert!(matches!(r, Reservation::InProgress { workflow_id } if workflow_id == first));
    }

    #[tokio::test]
    async fn test_completed_entry_is_cached_until_expiry() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::now_v7();
        let now = Utc::now();
        ledger.reserve_or_fetch("k", id, "booking", now).await.unwrap();
        ledger
            .complete("k", &outcome(id, "k"), now + Duration::seconds(60))
            .await
            .unwrap();

        let r = ledger
            .reserve_or_fetch("k", Uuid::now_v7(), "booking", now + Duration::seconds(30))
            .await
            .unwrap();
        assert!(matches!(r, Reservation::Cached(o) if o.workflow_id == id));

        let later = now + Duration::seconds(61);
        assert!(ledger.get("k", later).await.unwrap().is_none());
        let r = ledger
            .reserve_or_fetch("k", Uuid::now_v7(), "booking", later)
            .await
            .unwrap();
        assert!(matches!(r, Reservation::Reserved));
    }

    #[tokio::test]
    async fn test_complete_requires_matching_reservation() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::now_v7();
        let now = Utc::now();
        let err = ledger.complete("k", &outcome(id, "k"), now).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));

        ledger.reserve_or_fetch("k", id, "booking", now).await.unwrap();
        let err = ledger
            .complete("k", &outcome(Uuid::now_v7(), "k"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_release_only_drops_own_in_progress_entry() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::now_v7();
        let now = Utc::now();
        ledger.reserve_or_fetch("k", id, "booking", now).await.unwrap();

        assert!(!ledger.release("k", Uuid::now_v7()).await.unwrap());
        assert!(ledger.release("k", id).await.unwrap());
        assert!(ledger.is_empty());

        ledger.reserve_or_fetch("k", id, "booking", now).await.unwrap();
        ledger
            .complete("k", &outcome(id, "k"), now + Duration::hours(1))
            .await
            .unwrap();
        assert!(!ledger.release("k", id).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_entries() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        for (key, ttl) in [("a", 10), ("b", 100)] {
            let id = Uuid::now_v7();
            ledger.reserve_or_fetch(key, id, "booking", now).await.unwrap();
            ledger
                .complete(key, &outcome(id, key), now + Duration::seconds(ttl))
                .await
                .unwrap();
        }
        ledger
            .reserve_or_fetch("c", Uuid::now_v7(), "booking", now)
            .await
            .unwrap();

        let purged = ledger.purge_expired(now + Duration::seconds(50)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_admit_exactly_one() {
        let ledger = Arc::new(InMemoryLedger::new());
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .reserve_or_fetch("shared", Uuid::now_v7(), "booking", now)
                    .await
                    .unwrap()
            }));
        }
        let mut reserved = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Reservation::Reserved) {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 1);
    }
}
