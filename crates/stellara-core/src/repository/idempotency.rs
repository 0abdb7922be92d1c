//! Idempotency ledger trait definition.
//!
//! The ledger is the only state, besides the workflow store, shared across
//! concurrent runs. Every operation must be atomic per key: no caller may
//! observe a partially written entry for another run's key.

use chrono::{DateTime, Utc};
use stellara_types::error::RepositoryError;
use stellara_types::idempotency::{LedgerEntry, Reservation};
use stellara_types::workflow::WorkflowOutcome;
use uuid::Uuid;

/// Keyed store with atomic reserve-or-fetch semantics.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait IdempotencyLedger: Send + Sync {
    /// Reserve `key` for `workflow_id`, or report who already holds it.
    ///
    /// An entry whose retention window has passed at `now` is treated as
    /// absent and replaced by the new reservation.
    fn reserve_or_fetch(
        &self,
        key: &str,
        workflow_id: Uuid,
        workflow_type: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Reservation, RepositoryError>> + Send;

    /// Store the terminal outcome for a reservation held by `outcome.workflow_id`.
    ///
    /// Fails with `NotFound` if no reservation exists and with `Conflict`
    /// if the key is held by a different run.
    fn complete(
        &self,
        key: &str,
        outcome: &WorkflowOutcome,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Drop an in-progress reservation held by `workflow_id`.
    ///
    /// Returns `true` if an entry was removed. Completed entries are kept.
    fn release(
        &self,
        key: &str,
        workflow_id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Look up a live entry (expired entries read as `None`).
    fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<LedgerEntry>, RepositoryError>> + Send;

    /// Delete every entry whose retention window has passed. Returns the count.
    fn purge_expired(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
