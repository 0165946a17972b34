//! Storage Resource Graph Daemon
//!
//! Loads the bundled inventory plugin, keeps the resource graph in sync with
//! it on a fixed interval and exposes engine metrics for Prometheus.

use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_resource_graph::plugins::{inventory_module, INVENTORY_MODULE};
use storage_resource_graph::{
    Error, InMemoryStore, MetricsSnapshot, PluginManager, ResourceQuery, Result, Scheduler,
    SchedulerConfig, SessionEvent, SessionExit,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Resource Graph - keeps a persistent storage resource graph in sync with discovery plugins
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Inventory file read by the inventory plugin
    #[arg(long, env = "INVENTORY_FILE", default_value = "inventory.yaml")]
    inventory: PathBuf,

    /// Seconds between periodic updates
    #[arg(long, env = "UPDATE_INTERVAL", default_value = "10")]
    update_interval_secs: u64,

    /// Give up retrying a failing initial scan after this many seconds (0 retries forever)
    #[arg(long, env = "INITIAL_RETRY_MAX", default_value = "300")]
    initial_retry_max_secs: u64,

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

    /// Run one initial scan, print the resource tree as JSON and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            update_interval: Duration::from_secs(self.update_interval_secs.max(1)),
            initial_retry_max_elapsed: match self.initial_retry_max_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..SchedulerConfig::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let module = inventory_module(args.inventory.clone())
        .map_err(|e| Error::Configuration(format!("{:#}", e)))?;
    let store = Arc::new(InMemoryStore::new());
    let manager = PluginManager::new(store);
    manager.provide_module(module);

    if args.once {
        return run_once(&manager);
    }

    info!("Starting Storage Resource Graph");
    info!("  Version: {}", storage_resource_graph::VERSION);
    info!("  Inventory: {}", args.inventory.display());
    info!("  Update interval: {}s", args.update_interval_secs);

    tokio::spawn(log_events(manager.clone()));

    let health_addr = args.health_addr.clone();
    let health_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_manager).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_manager).await {
            error!("Metrics server error: {}", e);
        }
    });

    let scheduler = Scheduler::new(manager.clone(), args.scheduler_config());
    scheduler.spawn(INVENTORY_MODULE)?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    scheduler.shutdown();

    for (plugin, exit) in scheduler.join().await {
        match exit {
            SessionExit::Stopped => info!(%plugin, "Session stopped"),
            SessionExit::Broken(reason) => error!(%plugin, %reason, "Plugin broken"),
            SessionExit::Failed(reason) => error!(%plugin, %reason, "Session failed"),
        }
    }

    info!(metrics = ?manager.metrics().snapshot(), "Shutdown complete");
    Ok(())
}

/// Scan once and print the resulting tree
fn run_once(manager: &Arc<PluginManager>) -> Result<()> {
    let mut session = manager.create_session(INVENTORY_MODULE)?;
    let report = session.initial_scan()?;
    session.stop();
    info!(persisted = report.persisted, created = report.created, "Initial scan complete");

    let tree = ResourceQuery::new(manager).resource_tree(INVENTORY_MODULE)?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
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

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn", level)));

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

/// Log session events as they are broadcast
async fn log_events(manager: Arc<PluginManager>) {
    let mut events = manager.subscribe();
    loop {
        match events.recv().await {
            Ok(event @ SessionEvent::AlertRaised { .. }) => warn!(?event, "Alert raised"),
            Ok(event @ SessionEvent::AlertCleared { .. }) => info!(?event, "Alert cleared"),
            Ok(event) => debug!(?event, "Session event"),
            Err(RecvError::Lagged(missed)) => warn!(missed, "Event log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn respond(
    status: hyper::StatusCode,
    content_type: &str,
    body: impl Into<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, manager: Arc<PluginManager>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = !manager.active_sessions().is_empty();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" => respond(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "text/plain",
                            "no active sessions",
                        ),
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr(addr, "health")?;
    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Prometheus view of the engine counters
struct ExportedMetrics {
    scans: prometheus::IntGaugeVec,
    scan_failures: prometheus::IntGauge,
    resources: prometheus::IntGaugeVec,
    alerts: prometheus::IntGaugeVec,
    plugins_broken: prometheus::IntGauge,
    active_sessions: prometheus::IntGauge,
}

impl ExportedMetrics {
    fn register() -> Result<Self> {
        let internal = |e: prometheus::Error| Error::Internal(format!("Metric registration failed: {}", e));
        Ok(Self {
            scans: prometheus::register_int_gauge_vec!(
                "resource_graph_scans_total",
                "Scans started, by kind",
                &["kind"]
            )
            .map_err(internal)?,
            scan_failures: prometheus::register_int_gauge!(
                "resource_graph_scan_failures_total",
                "Scans that did not commit"
            )
            .map_err(internal)?,
            resources: prometheus::register_int_gauge_vec!(
                "resource_graph_resources_total",
                "Records created and culled",
                &["change"]
            )
            .map_err(internal)?,
            alerts: prometheus::register_int_gauge_vec!(
                "resource_graph_alert_transitions_total",
                "Alert transitions sent to the store",
                &["state"]
            )
            .map_err(internal)?,
            plugins_broken: prometheus::register_int_gauge!(
                "resource_graph_plugins_broken_total",
                "Plugins whose initial scan failed"
            )
            .map_err(internal)?,
            active_sessions: prometheus::register_int_gauge!(
                "resource_graph_active_sessions",
                "Plugin sessions currently registered"
            )
            .map_err(internal)?,
        })
    }

    fn update(&self, snapshot: &MetricsSnapshot) {
        let as_i64 = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        self.scans
            .with_label_values(&["initial"])
            .set(as_i64(snapshot.initial_scans));
        self.scans
            .with_label_values(&["update"])
            .set(as_i64(snapshot.update_scans));
        self.scan_failures.set(as_i64(snapshot.scan_failures));
        self.resources
            .with_label_values(&["created"])
            .set(as_i64(snapshot.resources_created));
        self.resources
            .with_label_values(&["culled"])
            .set(as_i64(snapshot.resources_culled));
        self.alerts
            .with_label_values(&["raised"])
            .set(as_i64(snapshot.alerts_raised));
        self.alerts
            .with_label_values(&["cleared"])
            .set(as_i64(snapshot.alerts_cleared));
        self.plugins_broken.set(as_i64(snapshot.plugins_broken));
        self.active_sessions.set(as_i64(snapshot.active_sessions));
    }
}

async fn run_metrics_server(addr: &str, manager: Arc<PluginManager>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let exported = Arc::new(ExportedMetrics::register()?);

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        let exported = exported.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                let exported = exported.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            exported.update(&manager.metrics().snapshot());
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&prometheus::gather(), &mut buffer) {
                                Ok(()) => respond(StatusCode::OK, encoder.format_type(), buffer),
                                Err(e) => respond(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    "text/plain",
                                    e.to_string(),
                                ),
                            }
                        }
                        "/stats" => match serde_json::to_vec(&manager.metrics().snapshot()) {
                            Ok(body) => respond(StatusCode::OK, "application/json", body),
                            Err(e) => respond(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "text/plain",
                                e.to_string(),
                            ),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr(addr, "metrics")?;
    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
