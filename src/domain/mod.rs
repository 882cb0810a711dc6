//! Domain Layer
//!
//! Events emitted by the built-in tasks and the ports they call through.

pub mod events;
pub mod ports;

pub use events::GardenEvent;
pub use ports::{Broadcaster, HealthProbe, Recalculation, RetentionStore, SignalKind, SignalSource};
