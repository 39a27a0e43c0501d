use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tollgate::config::TollgateConfig;
use tollgate::middleware::{post_auth, pre_auth};
use tollgate::ratelimit::{MemoryStore, RateLimiter};
use tollgate::server::HttpServer;

/// Rate limited HTTP demo service.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    init_tracing(args.log_json);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration, defaults when no file is given
    let mut config = match &args.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        routes = config.limiter.routes.len(),
        "Configuration loaded"
    );

    // Initialize the rate limiter
    let store = Arc::new(MemoryStore::new());
    let limiter = Arc::new(
        RateLimiter::builder()
            .config(config.limiter)
            .store(store.clone())
            .build()?,
    );

    // Sweep expired counters in the background
    if config.server.purge_interval_secs > 0 {
        tokio::spawn(purge_expired(
            store,
            Duration::from_secs(config.server.purge_interval_secs),
        ));
    }

    let app = demo_routes(limiter).layer(TraceLayer::new_for_http());

    // Run the server with graceful shutdown on Ctrl+C
    HttpServer::new(config.server.listen_addr, app)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tollgate=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

fn demo_routes(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route(
            "/users/{id}",
            get(|Path(id): Path<String>| async move { format!("user {}", id) }),
        )
        .route_layer(from_fn_with_state(limiter.clone(), post_auth))
        .route_layer(from_fn_with_state(limiter, pre_auth))
}

/// Periodically drop expired counters from the store.
async fn purge_expired(store: Arc<MemoryStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = store.purge_expired();
        if purged > 0 {
            debug!(purged, remaining = store.len(), "Purged expired counters");
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
