//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  SignalSource │ HealthProbe │ Broadcaster │ RetentionStore │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ HttpSignalSource │ HttpHealthProbe │ ChannelBroadcaster    │ │
//! │  │ SignalSummaryRecalculation │ RequestLogRetention           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod broadcaster;
mod http;
mod recalculation;
mod retention;

pub use broadcaster::{
    ChannelBroadcaster, CompositeBroadcaster, InMemoryEventCollector, LoggingBroadcaster,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use http::{HttpHealthProbe, HttpSignalSource, DEFAULT_FETCH_TIMEOUT, DEFAULT_PROBE_TIMEOUT};
pub use recalculation::SignalSummaryRecalculation;
pub use retention::RequestLogRetention;
