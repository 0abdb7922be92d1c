//! Observability for the Stellara saga engine: subscriber setup and a
//! tracing bridge for the saga event bus.

pub mod event_log;
pub mod tracing_setup;
