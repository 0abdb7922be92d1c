//! Shared domain types for the Stellara saga engine.
//!
//! Run and step records, lifecycle state machines, request/outcome shapes,
//! error classification, events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod workflow;
