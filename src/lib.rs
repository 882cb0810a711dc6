//! Plantfolio - orchestration core for the portfolio garden backend
//!
//! Keeps outbound calls within each provider's quota, keeps fetched data
//! in a two-tier cache, and runs the recurring refresh and housekeeping
//! work on a dependency-aware scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TaskScheduler                            │
//! │   sync_<source> ─▶ synthesize_mood / recalculate_growth / ...     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ RateLimiter  │    │ CacheManager │    │  Broadcaster │       │
//! │  │ bucket+window│    │ memory+redis │    │  (live feed) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use plantfolio::cache::{CacheConfig, CacheManager, SetOptions};
//!
//! # tokio_test::block_on(async {
//! let cache = CacheManager::new(CacheConfig::default());
//! assert!(cache.set("weather:current", Bytes::from_static(b"sunny"), SetOptions::new()).await);
//! assert_eq!(cache.get("WEATHER:current").await, Some(Bytes::from_static(b"sunny")));
//! # });
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Port implementations (HTTP, broadcast, retention)
//! - [`cache`] - Memory and network cache tiers
//! - [`config`] - YAML settings
//! - [`domain`] - Events and ports
//! - [`error`] - Error types
//! - [`health`] - Probe results and readiness
//! - [`ratelimit`] - Per-service admission control
//! - [`scheduler`] - Task scheduling
//! - [`tasks`] - Built-in task catalogue
//! - [`telemetry`] - Prometheus metrics

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod health;
pub mod ratelimit;
pub mod scheduler;
pub mod tasks;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheManager, SetOptions};
pub use config::Settings;
pub use domain::GardenEvent;
pub use error::{Error, Result};
pub use ratelimit::RateLimiter;
pub use scheduler::{TaskDefinition, TaskScheduler};
