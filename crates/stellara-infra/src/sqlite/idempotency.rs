//! SQLite idempotency ledger implementation.
//!
//! One row per idempotency key in `idempotency_ledger`. Reserve-or-fetch runs
//! inside a single writer transaction: expired rows for the key are dropped,
//! the reservation is attempted with `INSERT OR IGNORE`, and on a lost race
//! the surviving row decides what the caller observes.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stellara_core::repository::idempotency::IdempotencyLedger;
use stellara_types::error::RepositoryError;
use stellara_types::idempotency::{LedgerEntry, LedgerState, Reservation};
use stellara_types::workflow::WorkflowOutcome;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, parse_datetime, parse_uuid, query_error, to_json};

const LEDGER_COLUMNS: &str =
    "idempotency_key, workflow_id, workflow_type, state, outcome, reserved_at, expires_at";

/// SQLite-backed implementation of `IdempotencyLedger`.
pub struct SqliteLedger {
    pool: DatabasePool,
}

impl SqliteLedger {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// All entries, expired or not, newest reservation first.
    pub async fn list_entries(&self, limit: u32) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM idempotency_ledger ORDER BY reserved_at DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| LedgerRow::from_row(row).map_err(query_error)?.into_entry())
            .collect()
    }
}

struct LedgerRow {
    idempotency_key: String,
    workflow_id: String,
    workflow_type: String,
    state: String,
    outcome: Option<String>,
    reserved_at: String,
    expires_at: Option<String>,
}

impl LedgerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            idempotency_key: row.try_get("idempotency_key")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_type: row.try_get("workflow_type")?,
            state: row.try_get("state")?,
            outcome: row.try_get("outcome")?,
            reserved_at: row.try_get("reserved_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry, RepositoryError> {
        let state = match self.state.as_str() {
            "in_progress" => LedgerState::InProgress,
            "completed" => LedgerState::Completed,
            other => {
                return Err(RepositoryError::Query(format!(
                    "invalid ledger state: {other}"
                )));
            }
        };

        Ok(LedgerEntry {
            idempotency_key: self.idempotency_key,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_type: self.workflow_type,
            state,
            outcome: self
                .outcome
                .as_deref()
                .map(|s| from_json::<WorkflowOutcome>(s, "outcome"))
                .transpose()?,
            reserved_at: parse_datetime(&self.reserved_at)?,
            expires_at: self.expires_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

impl IdempotencyLedger for SqliteLedger {
    async fn reserve_or_fetch(
        &self,
        key: &str,
        workflow_id: Uuid,
        workflow_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation, RepositoryError> {
        let now_str = format_datetime(&now);
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            "DELETE FROM idempotency_ledger \
             WHERE idempotency_key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(key)
        .bind(&now_str)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let inserted = sqlx::query(
            r#"INSERT OR IGNORE INTO idempotency_ledger
               (idempotency_key, workflow_id, workflow_type, state, outcome, reserved_at, expires_at)
               VALUES (?, ?, ?, ?, NULL, ?, NULL)"#,
        )
        .bind(key)
        .bind(workflow_id.to_string())
        .bind(workflow_type)
        .bind(LedgerState::InProgress.as_str())
        .bind(&now_str)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let reservation = if inserted.rows_affected() == 1 {
            Reservation::Reserved
        } else {
            let row = sqlx::query(&format!(
                "SELECT {LEDGER_COLUMNS} FROM idempotency_ledger WHERE idempotency_key = ?"
            ))
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error)?;
            LedgerRow::from_row(&row)
                .map_err(query_error)?
                .into_entry()?
                .to_reservation()
        };

        tx.commit().await.map_err(query_error)?;
        Ok(reservation)
    }

    async fn complete(
        &self,
        key: &str,
        outcome: &WorkflowOutcome,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let holder: Option<String> =
            sqlx::query_scalar("SELECT workflow_id FROM idempotency_ledger WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
        let holder = parse_uuid(&holder.ok_or(RepositoryError::NotFound)?)?;
        if holder != outcome.workflow_id {
            return Err(RepositoryError::Conflict(format!(
                "key '{key}' is held by run {holder}"
            )));
        }

        sqlx::query(
            "UPDATE idempotency_ledger SET state = ?, outcome = ?, expires_at = ? \
             WHERE idempotency_key = ?",
        )
        .bind(LedgerState::Completed.as_str())
        .bind(to_json(outcome)?)
        .bind(format_datetime(&expires_at))
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn release(&self, key: &str, workflow_id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_ledger \
             WHERE idempotency_key = ? AND workflow_id = ? AND state = ?",
        )
        .bind(key)
        .bind(workflow_id.to_string())
        .bind(LedgerState::InProgress.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM idempotency_ledger \
             WHERE idempotency_key = ? AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(key)
        .bind(format_datetime(&now))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| LedgerRow::from_row(&row).map_err(query_error)?.into_entry())
            .transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_ledger WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "purged expired idempotency entries");
        }
        Ok(purged)
    }
}
