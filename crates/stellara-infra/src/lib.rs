//! Infrastructure layer for Stellara.
//!
//! Contains implementations of the storage ports defined in `stellara-core`
//! (SQLite workflow store and idempotency ledger) and the `config.toml`
//! loader.

pub mod config;
pub mod sqlite;
