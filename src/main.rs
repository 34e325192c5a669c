//! Netorch Controller Manager
//!
//! Runs every networking controller against the cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Controller Manager                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Watch     │───▶│    Event     │───▶│  Work Queue  │       │
//! │  │   Streams    │    │    Router    │    │  + Workers   │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                 ▼                │
//! │  peering │ interface │ load balancer │ NAT gateway │ release    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netorch::absence::AbsenceCache;
use netorch::adapters::{KubeObjectStore, LoggingEventPublisher};
use netorch::controller::{self, indexes, Context, ControllerManager, ManagerConfig, QueueConfig};
use netorch::domain::ports::ObjectStore;

static READY: AtomicBool = AtomicBool::new(false);

// =============================================================================
// CLI Arguments
// =============================================================================

/// Netorch - Declarative network control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Concurrent workers per controller
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Interval between full resyncs in seconds
    #[arg(long, env = "RESYNC_INTERVAL_SECONDS", default_value = "300")]
    resync_interval_seconds: u64,

    /// First retry delay after a failed reconcile, in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "5")]
    backoff_base_ms: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "BACKOFF_MAX_SECONDS", default_value = "1000")]
    backoff_max_seconds: u64,

    /// Claimant UIDs remembered as deleted
    #[arg(long, env = "ABSENCE_CACHE_CAPACITY", default_value = "4096")]
    absence_cache_capacity: usize,

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

    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            workers: self.workers.max(1),
            resync_interval: Duration::from_secs(self.resync_interval_seconds),
            queue: QueueConfig {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_secs(self.backoff_max_seconds),
            },
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        for crd in netorch::crd::all_crds() {
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting Netorch controller manager");
    info!("  Workers per controller: {}", args.workers);
    info!("  Resync interval: {}s", args.resync_interval_seconds);
    info!(
        "  Backoff: {}ms base, {}s cap",
        args.backoff_base_ms, args.backoff_max_seconds
    );
    info!("  Absence cache capacity: {}", args.absence_cache_capacity);

    let client = Client::try_default()
        .await
        .context("Kubernetes client creation failed")?;
    info!("Connected to Kubernetes cluster");

    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client));
    indexes::register_all(store.as_ref())?;

    let ctx = Context::new(
        store.clone(),
        Arc::new(LoggingEventPublisher::new()),
        Arc::new(AbsenceCache::new(args.absence_cache_capacity)),
    );
    let mut manager = ControllerManager::new(store, args.manager_config());
    controller::register_all(&mut manager, &ctx)?;
    info!("Registered controllers: {}", manager.controller_names().join(", "));

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    READY.store(true, Ordering::SeqCst);
    manager.run(shutdown).await?;
    READY.store(false, Ordering::SeqCst);

    info!("Controller manager shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?);

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
    Ok(())
}

// =============================================================================
// HTTP Servers
// =============================================================================

type Body = http_body_util::Full<hyper::body::Bytes>;

fn respond(status: hyper::StatusCode, body: impl Into<hyper::body::Bytes>) -> hyper::Response<Body> {
    let mut response = hyper::Response::new(Body::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn serve<F, Fut>(name: &'static str, addr: &str, handler: F) -> anyhow::Result<()>
where
    F: Fn(hyper::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<hyper::Response<Body>, std::convert::Infallible>>
        + Send
        + 'static,
{
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {} server address", name))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} server", name))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .with_context(|| format!("{} server accept error", name))?;

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                tracing::error!("{} server connection error: {}", name, e);
            }
        });
    }
}

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    use hyper::StatusCode;

    async fn health_handler(
        req: hyper::Request<hyper::body::Incoming>,
    ) -> Result<hyper::Response<Body>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
            "/readyz" if READY.load(Ordering::SeqCst) => respond(StatusCode::OK, "ok"),
            "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    serve("Health", addr, health_handler).await
}

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::StatusCode;

    async fn metrics_handler(
        req: hyper::Request<hyper::body::Incoming>,
    ) -> Result<hyper::Response<Body>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match netorch::metrics::gather_text() {
                Ok((content_type, buffer)) => {
                    let mut response = respond(StatusCode::OK, buffer);
                    if let Ok(value) = content_type.parse() {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("{}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                }
            },
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    serve("Metrics", addr, metrics_handler).await
}
