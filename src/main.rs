//! Workcell orchestration daemon
//!
//! Runs the workcell manager: the HTTP control plane, the scheduler/engine
//! loop, and the node status poller.
//!
//! ## Endpoints
//!
//! - `POST /workflow_definition`, `GET /workflow_definition/:id`
//! - `POST /workflow` (multipart) - submit a workflow
//! - `GET  /workflow/:id`, pause/resume/cancel/retry controls
//! - `GET  /workflows/active | /workflows/archived | /workflows/queue`
//! - `GET|POST /node`, `GET /nodes`, `GET /node/:name`, admin passthrough
//! - `GET  /state`, `GET /locations`, location CRUD
//! - `GET  /healthz`
//!
//! ## Background Tasks
//!
//! - Scheduler/engine loop (1s tick by default)
//! - Node status poller (2s by default)
//!
//! Exit codes: 0 success, 1 runtime failure, 2 validation failure,
//! 130 interrupted.

use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workcelld::config::{AppState, Config};
use workcelld::engine::node_poll_loop;
use workcelld::handlers;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workcelld=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let bind_addr = config.bind_addr();

    info!("Starting workcell manager '{}'", config.workcell_name);
    info!("Binding to: {}", bind_addr);
    if let Some(path) = &config.state_path {
        info!("State snapshot: {}", path.display());
    } else {
        info!("No state path configured - running in-memory");
    }

    // Create shared state (replays the snapshot, requeues interrupted
    // workflows)
    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Invalid configuration or state snapshot: {}", e);
            std::process::exit(2);
        }
    };

    // Build router with all control-plane endpoints
    let app = handlers::router(state.clone())
        // Add CORS support
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Add request tracing
        .layer(TraceLayer::new_for_http());

    // Start background tasks
    let engine_loop = state.engine.clone();
    let tick = state.config.tick();
    let engine_handle = tokio::spawn(async move {
        engine_loop.run_loop(tick).await;
    });

    let poll_state = state.state.clone();
    let poll_clients = state.clients.clone();
    let poll_interval = state.config.node_poll();
    let poll_handle = tokio::spawn(async move {
        node_poll_loop(poll_state, poll_clients, poll_interval).await;
    });

    info!("Background tasks started (engine loop, node poller)");

    // Start server with graceful shutdown
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on {}", bind_addr);

    let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let signal_flag = interrupted.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(signal_flag))
        .await;

    // Shutdown sequence
    info!("Shutdown signal received, stopping background tasks...");
    engine_handle.abort();
    poll_handle.abort();

    if let Err(e) = serve_result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Workcell manager shutdown complete");
    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
        std::process::exit(130);
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM). Marks the flag on SIGINT
/// so the process can exit 130.
async fn shutdown_signal(interrupted: std::sync::Arc<std::sync::atomic::AtomicBool>) {
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
            interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
        },
        _ = terminate => {},
    }
}
