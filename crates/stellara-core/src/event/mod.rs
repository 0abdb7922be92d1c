//! Event bus for saga lifecycle notifications.
//!
//! Provides an `EventBus` that distributes `SagaEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel, and a per-run
//! `RunEvents` stream.

pub mod bus;

pub use bus::{EventBus, RunEvents};
