//! Observability: structured events and logging setup.
//!
//! The gateway emits events; it does not render dashboards. Metric counters
//! on the hot paths go through the `metrics` facade in the modules that own
//! them.

pub mod events;
pub mod logging;

pub use events::{EventBus, GatewayEvent};
