//! Error types for the Plantfolio orchestration core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the orchestration core
///
/// Expected outcomes (rate-limit denial, cache miss, unmet dependency gate)
/// are not errors and never appear here.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Scheduler Errors
    // =========================================================================
    /// Task id was never registered
    #[error("Task not registered: {0}")]
    TaskNotFound(String),

    /// A task depends on an id that is not registered
    #[error("Task {task_id} depends on unregistered task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    /// The dependency graph contains a cycle
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// Invalid recurrence expression
    #[error("Invalid schedule expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// Scheduler lifecycle misuse
    #[error("Scheduler is already running")]
    AlreadyRunning,

    // =========================================================================
    // Rate Limiting Errors
    // =========================================================================
    /// Admission was not granted within the allowed wait
    #[error("Rate limit exceeded for service {service}")]
    RateLimitExceeded { service: String },

    /// Outbound call failed after all backoff attempts
    #[error("Call to {service} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        reason: String,
    },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Network cache tier error
    #[error("Network cache error: {0}")]
    NetworkCache(String),

    /// Redis driver error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// HTTP collaborator error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A signal source answered but not usefully
    #[error("Signal {name} unavailable: {reason}")]
    SignalUnavailable { name: String, reason: String },
}
