//! Plantfolio Orchestrator
//!
//! Runs the built-in task catalogue against the configured signal sources
//! and serves health and Prometheus endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Plantfolio Orchestrator                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Signal     │───▶│  Scheduler   │───▶│    Cache     │       │
//! │  │   Sources    │    │  (tasks)     │    │ memory+redis │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          /healthz /readyz            /metrics                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plantfolio::adapters::{
    HttpHealthProbe, HttpSignalSource, LoggingBroadcaster, RequestLogRetention,
    SignalSummaryRecalculation,
};
use plantfolio::cache::{CacheManager, InMemoryNetworkStore, NetworkStore, RedisStore};
use plantfolio::config::Settings;
use plantfolio::domain::ports::{HealthProbe, RetentionStore, SignalSource};
use plantfolio::error::{Error, Result};
use plantfolio::health::HealthState;
use plantfolio::ratelimit::RateLimiter;
use plantfolio::scheduler::TaskScheduler;
use plantfolio::tasks::{register_catalogue, GardenServices};
use plantfolio::telemetry;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Plantfolio orchestrator - rate limiting, caching and scheduled refreshes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "PLANTFOLIO_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the network cache tier (overrides the settings file)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Disable rate limiting entirely
    #[arg(long, env = "DISABLE_RATE_LIMITS")]
    disable_rate_limits: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);
    telemetry::init();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(url) = &args.redis_url {
        settings.cache.redis_url = Some(url.clone());
    }
    if args.disable_rate_limits {
        settings.rate_limits.enabled = false;
    }

    info!("Starting Plantfolio orchestrator");
    info!(
        "  Settings: {}",
        serde_json::to_string(&settings.redacted()).unwrap_or_default()
    );

    let limiter = Arc::new(RateLimiter::new(settings.rate_limits.clone()));
    let cache = Arc::new(build_cache(&settings).await);
    let health = Arc::new(HealthState::new());

    let mut sources: Vec<Arc<dyn SignalSource>> = Vec::with_capacity(settings.sources.len());
    for source in &settings.sources {
        let mut adapter = HttpSignalSource::new(
            &source.name,
            source.service(),
            source.kind,
            &source.url,
            Duration::from_secs(source.timeout_seconds),
        )?;
        for (name, value) in &source.headers {
            adapter = adapter.with_header(name, value);
        }
        sources.push(Arc::new(adapter));
    }

    let mut probes: Vec<Arc<dyn HealthProbe>> = Vec::with_capacity(settings.probes.len());
    for probe in &settings.probes {
        let mut adapter = HttpHealthProbe::new(
            &probe.name,
            &probe.url,
            Duration::from_secs(probe.timeout_seconds),
        )?;
        if let Some(ms) = probe.degraded_after_ms {
            adapter = adapter.degraded_after(Duration::from_millis(ms));
        }
        probes.push(Arc::new(adapter));
    }

    let retention: Vec<Arc<dyn RetentionStore>> =
        vec![Arc::new(RequestLogRetention::new(Arc::clone(&limiter)))];

    let services = GardenServices {
        limiter,
        cache: Arc::clone(&cache),
        broadcaster: Arc::new(LoggingBroadcaster::info_level()),
        recalculation: Arc::new(SignalSummaryRecalculation::new()),
        health: Arc::clone(&health),
        sources,
        probes,
        retention,
    };

    let scheduler = TaskScheduler::new(settings.scheduler_config());
    register_catalogue(&scheduler, &services, &settings.catalogue_config())?;
    scheduler.start()?;

    let shutdown = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(
        Duration::from_secs(settings.cache.sweep_interval_seconds.max(1)),
        shutdown.child_token(),
    );

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_state = Arc::clone(&health);
    let health_shutdown = shutdown.child_token();
    let health_server = tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_state, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.child_token();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    health.set_ready(true);
    info!("Orchestrator running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    health.set_ready(false);
    scheduler.stop().await;
    shutdown.cancel();
    for handle in [sweeper, health_server, metrics_server] {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}

/// Cache with Redis when configured and reachable, else an in-process tier
async fn build_cache(settings: &Settings) -> CacheManager {
    let config = settings.cache_config();

    let store: Arc<dyn NetworkStore> = match &settings.cache.redis_url {
        Some(url) => match RedisStore::connect(url, settings.cache.key_prefix.clone()).await {
            Ok(store) => {
                info!("Connected to Redis network cache");
                Arc::new(store)
            }
            Err(e) => {
                error!("Redis unavailable, continuing with memory-only cache: {}", e);
                return CacheManager::new(config);
            }
        },
        None => {
            info!("No Redis URL configured, using in-process network tier");
            Arc::new(InMemoryNetworkStore::new())
        }
    };

    CacheManager::with_network(config, store)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "reqwest=info", "redis=info"]
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// Accept connections until `shutdown` fires, serving each with `handler`
async fn serve<F, Fut>(addr: &str, name: &str, shutdown: CancellationToken, handler: F) -> Result<()>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = std::result::Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} server stopped", name);
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}

async fn run_health_server(
    addr: &str,
    health: Arc<HealthState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let handler = move |req: Request<Incoming>| {
        let health = Arc::clone(&health);
        async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                "/readyz" => {
                    let body = health
                        .last_report()
                        .and_then(|report| serde_json::to_vec(&report).ok())
                        .unwrap_or_else(|| b"{}".to_vec());
                    let status = if health.is_ready() {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    respond(status, "application/json", body)
                }
                _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
            };
            Ok::<_, Infallible>(response)
        }
    };

    serve(addr, "Health", shutdown, handler).await
}

async fn run_metrics_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    let handler = |req: Request<Incoming>| async move {
        let response = match req.uri().path() {
            "/metrics" => match telemetry::encode() {
                Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encoding failed")
                }
            },
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok::<_, Infallible>(response)
    };

    serve(addr, "Metrics", shutdown, handler).await
}
