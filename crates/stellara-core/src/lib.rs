//! Saga orchestration engine and storage port definitions for Stellara.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus in-memory adapters for tests and embedded use. It
//! depends only on `stellara-types` -- never on `stellara-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod saga;
