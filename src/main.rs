//! Insight Sync diagnostics runner
//!
//! Follows one project against the hosted backend and serves a small
//! read-only HTTP surface for inspecting channels, the current snapshot and
//! the sync strategy.

use anyhow::Context;
use axum::{extract::State, http::Method, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use insight_sync::storage::PostgrestDataSource;
use insight_sync::sync::{
    ChannelRegistry, ConnectionState, RealtimeClient, StrategySelector, SyncStrategy,
};
use insight_sync::transport::PhoenixTransport;
use insight_sync::ClientConfig;

/// Shared application state
struct AppState {
    client: Arc<RealtimeClient>,
    registry: Arc<ChannelRegistry>,
    selector: Arc<StrategySelector>,
    started_at: std::time::Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    channels: usize,
    project_id: Option<String>,
    connection_state: ConnectionState,
    strategy: SyncStrategy,
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.client.snapshot();
    let status = match snapshot.connection_state {
        ConnectionState::Connected => "healthy",
        ConnectionState::Connecting => "connecting",
        _ if snapshot.project_id.is_none() => "idle",
        _ => "degraded",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        channels: state.registry.len(),
        project_id: snapshot.project_id,
        connection_state: snapshot.connection_state,
        strategy: snapshot.strategy,
    })
}

async fn list_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.get_channel_stats())
}

async fn get_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.client.snapshot())
}

async fn get_strategy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.selector.feature_status())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "insight_sync=info,tower_http=info".into()),
        )
        .init();

    let mut config = ClientConfig::from_env().context("Invalid configuration")?;
    if config.project_id.is_none() {
        config.project_id = std::env::args().nth(1);
    }
    let company_id = config.company_id()?.to_string();

    let transport = Arc::new(PhoenixTransport::new(config.phoenix_config()?));
    let source = Arc::new(
        PostgrestDataSource::new(config.postgrest_config()?).context("Failed to build REST client")?,
    );

    let registry = Arc::new(ChannelRegistry::new(config.registry.clone(), transport.clone()));
    let sweep_handle = registry.clone().start_cleanup_task();

    let selector = Arc::new(StrategySelector::new(config.strategy.clone()));
    selector.on_transition(|t| {
        info!("Strategy for {} is now {} ({})", t.feature, t.to, t.reason);
    });
    let monitor_handle = selector.clone().start_monitoring();

    let client = Arc::new(
        RealtimeClient::new(company_id.clone(), registry.clone(), source)
            .with_data_config(config.data.clone())
            .with_presence_config(config.presence.clone())
            .with_strategy_selector(selector.clone()),
    );

    // Log snapshot changes
    let mut updates = WatchStream::new(client.watch());
    tokio::spawn(async move {
        while let Some(snapshot) = updates.next().await {
            debug!(
                "Snapshot: {} interviews, {} viewed, {:?}, strategy {}",
                snapshot.interviews.len(),
                snapshot.presence.len(),
                snapshot.connection_state,
                snapshot.strategy
            );
        }
    });

    match config.project_id.as_deref() {
        Some(project_id) => match client.subscribe_to_project(project_id).await {
            Ok(snapshot) => info!(
                "Following project {} ({} interviews)",
                project_id,
                snapshot.interviews.len()
            ),
            Err(e) => warn!("Initial load of {} failed: {}", project_id, e),
        },
        None => warn!("No project given; set SYNC_PROJECT_ID or pass it as the first argument"),
    }

    let state = Arc::new(AppState {
        client: client.clone(),
        registry: registry.clone(),
        selector: selector.clone(),
        started_at: std::time::Instant::now(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/channels", get(list_channels))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/strategy", get(get_strategy))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.diagnostics_port));

    info!("Insight Sync v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Company: {}", company_id);
    info!("   Diagnostics: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    client.unsubscribe().await;
    registry.close_all_channels().await;
    registry.shutdown();
    selector.shutdown();
    let _ = tokio::join!(sweep_handle, monitor_handle);
    transport.disconnect().await;

    info!("Insight Sync stopped");
    Ok(())
}
