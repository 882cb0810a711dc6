//! HTTP Adapters
//!
//! Implements the `SignalSource` and `HealthProbe` ports over plain HTTP
//! JSON endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::ports::{HealthProbe, SignalKind, SignalSource};
use crate::error::{Error, Result};
use crate::health::HealthCheckResult;

/// Default request timeout for signal fetches.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default request timeout for health probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("plantfolio/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

// =============================================================================
// Signal Source
// =============================================================================

/// Signal source backed by an HTTP endpoint returning JSON.
pub struct HttpSignalSource {
    name: String,
    service: String,
    kind: SignalKind,
    url: String,
    headers: Vec<(String, String)>,
    client: Client,
}

impl HttpSignalSource {
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        kind: SignalKind,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            service: service.into(),
            kind,
            url: url.into(),
            headers: Vec::new(),
            client: build_client(timeout)?,
        })
    }

    /// Extra request header, e.g. an API token
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for HttpSignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSignalSource")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .finish()
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn kind(&self) -> SignalKind {
        self.kind
    }

    #[instrument(skip(self), fields(signal = %self.name))]
    async fn fetch(&self) -> Result<Value> {
        let mut request = self.client.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::SignalUnavailable {
                name: self.name.clone(),
                reason: format!("endpoint returned status {}", response.status()),
            });
        }

        let value: Value = response.json().await?;
        debug!(signal = %self.name, "Fetched signal");
        Ok(value)
    }
}

// =============================================================================
// Health Probe
// =============================================================================

/// Health probe that GETs a URL and grades the answer.
///
/// A success status within `degraded_after` is healthy, a slow success is
/// degraded, and anything else is unhealthy.
pub struct HttpHealthProbe {
    name: String,
    url: String,
    degraded_after: Duration,
    client: Client,
}

impl HttpHealthProbe {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            url: url.into(),
            degraded_after: timeout / 2,
            client: build_client(timeout)?,
        })
    }

    pub fn degraded_after(mut self, threshold: Duration) -> Self {
        self.degraded_after = threshold;
        self
    }
}

impl std::fmt::Debug for HttpHealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHealthProbe")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("degraded_after", &self.degraded_after)
            .finish()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result = match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => {
                if started.elapsed() > self.degraded_after {
                    HealthCheckResult::degraded(&self.name, "slow response")
                } else {
                    HealthCheckResult::healthy(&self.name)
                }
            }
            Ok(response) => HealthCheckResult::unhealthy(
                &self.name,
                format!("status {}", response.status()),
            ),
            Err(e) => HealthCheckResult::unhealthy(&self.name, e.to_string()),
        };
        result.with_latency(started.elapsed())
    }
}
