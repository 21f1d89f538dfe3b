use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber;

use floodgate::config::{FloodgateConfig, StoreBackend};
use floodgate::http::{AdmissionConfig, AdmissionLayer, KeyStrategy, MultiLimit};
use floodgate::mesh::{Cluster, MeshStore};
use floodgate::ratelimit::{MemoryStore, RateLimitEngine, WindowStore};

/// Request admission control for API endpoints.
#[derive(Parser, Debug)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("Starting Floodgate Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => FloodgateConfig::from_file(path)?,
        None => FloodgateConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, backend = ?config.store.backend, "Configuration loaded");

    match config.store.backend {
        StoreBackend::Memory => serve(RateLimitEngine::new(MemoryStore::new()), config).await,
        StoreBackend::Mesh => {
            let cluster = Cluster::start(config.store.mesh.cluster_config())
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            info!(node_id = %cluster.node_id(), "Mesh store joined cluster");
            serve(
                RateLimitEngine::new(MeshStore::new(Arc::new(cluster))),
                config,
            )
            .await
        }
    }
}

async fn serve<S: WindowStore + 'static>(
    engine: RateLimitEngine<S>,
    config: FloodgateConfig,
) -> anyhow::Result<()> {
    let engine = Arc::new(engine);

    // Register every configured limiter up front; a bad rule aborts
    // startup instead of leaving an endpoint unlimited.
    for (name, rule) in &config.limits {
        engine.register_limiter(name, rule.into())?;
    }
    info!(limiters = config.limits.len(), "Limiters registered");

    // Background sweeper for expired windows and blocks.
    let sweeper = engine.clone();
    let sweep_interval = config.store.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            match sweeper.sweep().await {
                Ok(removed) if removed > 0 => debug!(removed, "Swept expired entries"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Sweep failed"),
            }
        }
    });

    let app = router(engine, &config)?;
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;

    info!("Starting HTTP server on {}", config.server.listen_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Floodgate Admission Control Service stopped");
    Ok(())
}

/// Wire the admission layers onto the protected surfaces.
///
/// The handlers below stand in for the host application; Floodgate's
/// job ends at admitting or rejecting the request.
fn router<S: WindowStore + 'static>(
    engine: Arc<RateLimitEngine<S>>,
    config: &FloodgateConfig,
) -> anyhow::Result<Router> {
    let timeout = config.store.check_timeout();

    // Login keys on the claimed identity and refunds successful
    // sign-ins, so only failed attempts burn capacity.
    let login = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::single("login")
            .key_strategy(KeyStrategy::Login)
            .skip_successful(true)
            .message("Too many login attempts, please try again later.")
            .check_timeout(timeout)
            .build(),
    )?;

    let password_reset = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::single("password-reset")
            .key_strategy(KeyStrategy::Login)
            .message("Too many password reset requests.")
            .check_timeout(timeout)
            .build(),
    )?;

    let read_api = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::multi(vec![
            MultiLimit {
                limiter: "method:GET".into(),
                points: 1,
                message: "Read rate limit exceeded.".into(),
            },
            MultiLimit {
                limiter: "api".into(),
                points: 1,
                message: "API rate limit exceeded.".into(),
            },
        ])
        .key_strategy(KeyStrategy::Combined)
        .check_timeout(timeout)
        .build(),
    )?;

    let write_api = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::multi(vec![
            MultiLimit {
                limiter: "method:POST".into(),
                points: 1,
                message: "Write rate limit exceeded.".into(),
            },
            MultiLimit {
                limiter: "api".into(),
                points: 1,
                message: "API rate limit exceeded.".into(),
            },
        ])
        .key_strategy(KeyStrategy::Combined)
        .check_timeout(timeout)
        .build(),
    )?;

    let tiered = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::tiered(
            config.tiers.base.clone(),
            config.tiers.capacities.clone(),
            std::time::Duration::from_secs(config.tiers.duration_secs),
        )
        .key_strategy(KeyStrategy::User)
        .check_timeout(timeout)
        .build(),
    )?;

    let webhook = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::single("webhook")
            .key_strategy(KeyStrategy::ApiKey)
            .check_timeout(timeout)
            .build(),
    )?;

    let upload = AdmissionLayer::new(
        engine.clone(),
        AdmissionConfig::single("upload")
            .key_strategy(KeyStrategy::Combined)
            .check_timeout(timeout)
            .build(),
    )?;

    let export = AdmissionLayer::new(
        engine,
        AdmissionConfig::single("export")
            .key_strategy(KeyStrategy::User)
            .check_timeout(timeout)
            .build(),
    )?;

    let api = Router::new()
        .route("/workflows", get(list_workflows))
        .route("/executions", get(list_executions))
        .layer(read_api)
        .merge(
            Router::new()
                .route("/workflows/run", post(run_workflow))
                .layer(write_api),
        )
        .layer(tiered);

    let app = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login_stub).layer(login))
        .route(
            "/auth/password-reset",
            post(password_reset_stub).layer(password_reset),
        )
        .nest("/api", api)
        .route("/webhooks", post(webhook_stub).layer(webhook))
        .route("/uploads", post(upload_stub).layer(upload))
        .route("/exports", post(export_stub).layer(export))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    Ok(app)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn login_stub() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

async fn password_reset_stub() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

async fn list_workflows() -> Json<serde_json::Value> {
    Json(json!({ "workflows": [] }))
}

async fn list_executions() -> Json<serde_json::Value> {
    Json(json!({ "executions": [] }))
}

async fn run_workflow() -> Json<serde_json::Value> {
    Json(json!({ "status": "queued" }))
}

async fn webhook_stub() -> Json<serde_json::Value> {
    Json(json!({ "received": true }))
}

async fn upload_stub() -> Json<serde_json::Value> {
    Json(json!({ "uploaded": true }))
}

async fn export_stub() -> Json<serde_json::Value> {
    Json(json!({ "export": "started" }))
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
