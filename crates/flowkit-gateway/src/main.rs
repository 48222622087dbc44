// Flowkit gateway: HTTP webhook boundary + WebSocket bridge over the engine.

mod state;
mod storage;
mod webhook;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use flowkit_core::config::EngineConfig;
use flowkit_engine::EngineBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("flowkit_gateway={},tower_http=info", config.log_level).into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowkit-gateway starting...");

    let built = storage::build(&config).await.context("failed to initialize storage adapters")?;
    let engine = EngineBuilder::new(built.queue, built.store, built.bus, config.clone()).build().context("failed to build engine")?;
    let engine = Arc::new(engine);

    engine.runner.clone().start().await.context("failed to start runner")?;

    let projection = engine.projection.clone();
    let events = engine.events.clone();
    tokio::spawn(async move {
        projection.run_stall_detector(events, 30_000, 5 * 60_000).await;
    });

    let state = AppState { engine };

    let app = Router::new()
        .merge(webhook::health_routes())
        .merge(webhook::routes())
        .merge(ws::routes())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("FLOWKIT_GATEWAY_ADDR").unwrap_or_else(|_| "0.0.0.0:9100".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind gateway address")?;
    tracing::info!(addr, "listening");

    axum::serve(listener, app).await.context("gateway server error")?;

    Ok(())
}
