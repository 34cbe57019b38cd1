//! faultline-daemon - Workflow Failure Detection and Remediation Daemon
//!
//! The daemon wires the constructed root (store, cache, rules, policies,
//! clock, jitter) into every component explicitly; there is no ambient
//! settings object. It runs three long-lived pieces:
//!
//! - the **HTTP surface**: a thin mapping from event submissions to
//!   ingestion pipeline calls, plus the Prometheus `/metrics` endpoint
//!   (localhost only)
//! - the **incident detector**: groups persisted failure events into
//!   incidents past a durable watermark
//! - the **action scheduler**: drives pending remediation actions through
//!   the state machine
//!
//! Shutdown is cooperative: SIGTERM/SIGINT set a flag the workers observe
//! between work items, never mid-item.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration;
use clap::Parser;
use faultline_core::clock::{Clock, SystemClock, ThreadRngJitter};
use faultline_core::config::FaultlineConfig;
use faultline_core::event::EventSubmission;
use faultline_core::fingerprint::Fingerprinter;
use faultline_core::types::CorrelationId;
use faultline_daemon::cache::InMemoryCache;
use faultline_daemon::classifier::RuleClassifier;
use faultline_daemon::coordinator::ActionCoordinator;
use faultline_daemon::detector::IncidentDetector;
use faultline_daemon::metrics::{SharedMetricsRegistry, new_shared_registry};
use faultline_daemon::pipeline::IngestionPipeline;
use faultline_daemon::recorder::DecisionRecorder;
use faultline_daemon::safety::{BreakerManager, RateLimiter, RetryBudget};
use faultline_daemon::scheduler::{AckDispatchExecutor, ActionScheduler};
use faultline_daemon::store::Store;
use serde_json::json;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// faultline daemon - workflow failure detection and remediation
#[derive(Parser, Debug)]
#[command(name = "faultline-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "faultline.toml")]
    config: PathBuf,

    /// Path to the SQLite database file
    #[arg(long, default_value = "faultline.db")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Port for the HTTP surface (ingest + metrics); overrides config
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    // Load configuration; a missing file means defaults.
    let config = if args.config.exists() {
        FaultlineConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        FaultlineConfig::default()
    };
    if !args.config.exists() {
        info!("no config file found at {:?}, using defaults", args.config);
    }
    let config = Arc::new(config);

    // The constructed root. Every component receives its dependencies
    // explicitly; the clock and jitter are trait objects so tests pin them.
    let store = Store::open(&args.db).context("failed to open database")?;
    let cache = Arc::new(InMemoryCache::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jitter = Arc::new(ThreadRngJitter);
    let rules = Arc::new(config.rules_table());
    let fingerprinter = Arc::new(Fingerprinter::new());
    let metrics_registry = new_shared_registry().context("failed to initialize metrics")?;
    let metrics = metrics_registry.metrics();

    let breaker = Arc::new(BreakerManager::new(
        cache.clone(),
        store.admin(),
        Arc::clone(&config),
        clock.clone(),
    ));
    let ratelimit = Arc::new(RateLimiter::new(
        cache.clone(),
        Arc::clone(&config),
        clock.clone(),
    ));
    let budget = Arc::new(RetryBudget::new(
        cache.clone(),
        Arc::clone(&config),
        clock.clone(),
    ));
    let recorder = Arc::new(DecisionRecorder::new(store.decisions(), clock.clone()));
    let coordinator = Arc::new(ActionCoordinator::new(
        store.actions(),
        store.incidents(),
        Arc::clone(&recorder),
        Arc::clone(&budget),
        Arc::clone(&rules),
        Arc::clone(&config),
        clock.clone(),
        jitter.clone(),
    ));

    let detector_wakeup = Arc::new(Notify::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let pipeline = Arc::new(IngestionPipeline::new(
        store.events(),
        store.admin(),
        RateLimiter::new(cache.clone(), Arc::clone(&config), clock.clone()),
        Arc::clone(&breaker),
        clock.clone(),
        Arc::clone(&detector_wakeup),
        metrics.clone(),
    ));

    let detector = Arc::new(IncidentDetector::new(
        store.clone(),
        Arc::clone(&recorder),
        Arc::clone(&coordinator),
        Arc::new(RuleClassifier::new(Arc::clone(&rules))),
        fingerprinter,
        Arc::clone(&rules),
        Arc::clone(&config),
        clock.clone(),
        jitter.clone(),
        Arc::clone(&detector_wakeup),
        Arc::clone(&shutdown),
        metrics.clone(),
    ));

    let scheduler = Arc::new(ActionScheduler::new(
        store.actions(),
        store.incidents(),
        Arc::clone(&coordinator),
        Arc::new(AckDispatchExecutor),
        Arc::clone(&breaker),
        Arc::clone(&ratelimit),
        Arc::clone(&config),
        clock.clone(),
        jitter,
        Arc::clone(&shutdown),
        metrics,
    ));

    info!(
        db = %args.db.display(),
        error_codes = rules.len(),
        "faultline daemon started (pid: {})",
        std::process::id()
    );

    // Background workers.
    let detector_task = {
        let detector = Arc::clone(&detector);
        tokio::spawn(async move { detector.run().await })
    };
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    // HTTP surface.
    let port = args.port.unwrap_or(config.metrics.port);
    let surface_task = if config.metrics.disabled && args.port.is_none() {
        info!("HTTP surface disabled");
        None
    } else {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let surface = SurfaceState {
            pipeline: Arc::clone(&pipeline),
            clock: clock.clone(),
            store_timeout_secs: config.pipeline.store_timeout_secs,
            metrics: Arc::clone(&metrics_registry),
        };
        Some(tokio::spawn(async move {
            if let Err(e) = run_surface(surface, addr).await {
                error!("HTTP surface error: {e}");
            }
        }))
    };

    // Unix signal handling.
    let signal_shutdown = Arc::clone(&shutdown);
    let signal_wakeup = Arc::clone(&detector_wakeup);
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_shutdown.store(true, Ordering::SeqCst);
        // unblock the detector's wait so it observes the flag promptly
        signal_wakeup.notify_waiters();
    });

    signal_task.await.ok();

    info!("shutting down workers...");
    detector_task.await.ok();
    scheduler_task.await.ok();
    if let Some(task) = surface_task {
        task.abort();
    }

    info!("daemon shutdown complete");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP surface
// =============================================================================

/// Shared state for the thin HTTP surface.
#[derive(Clone)]
struct SurfaceState {
    pipeline: Arc<IngestionPipeline>,
    clock: Arc<dyn Clock>,
    store_timeout_secs: u64,
    metrics: SharedMetricsRegistry,
}

/// Serves the ingest and metrics routes on localhost.
async fn run_surface(state: SurfaceState, addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/api/v1/events", post(submit_event))
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(|| async { "ok\n" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP surface")?;
    info!(addr = %addr, "HTTP surface listening");

    axum::serve(listener, app).await.context("surface error")?;
    Ok(())
}

/// Thin mapping: request in, pipeline call, typed response out. All
/// behavior lives in the pipeline.
async fn submit_event(
    State(state): State<SurfaceState>,
    headers: HeaderMap,
    Json(submission): Json<EventSubmission>,
) -> impl IntoResponse {
    let correlation_id = CorrelationId::from_inbound(
        headers
            .get("x-correlation-id")
            .and_then(|value| value.to_str().ok()),
    );
    let deadline = state.clock.now()
        + Duration::seconds(i64::try_from(state.store_timeout_secs).unwrap_or(5));

    match state
        .pipeline
        .ingest(&submission, correlation_id.clone(), deadline)
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(json!({
                "event_id": receipt.event_id,
                "status": receipt.status.as_str(),
                "correlation_id": receipt.correlation_id.as_str(),
            })),
        ),
        Err(err) => {
            let rejection = err.to_rejection(correlation_id);
            let status = StatusCode::from_u16(rejection.code.status_class())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({
                    "code": rejection.code.as_str(),
                    "message": rejection.message,
                    "details": rejection.details,
                    "correlation_id": rejection.correlation_id.as_str(),
                    "retry_after": rejection.retry_after_secs,
                })),
            )
        },
    }
}

async fn serve_metrics(State(state): State<SurfaceState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}
