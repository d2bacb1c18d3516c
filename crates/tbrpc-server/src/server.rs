//! HTTP server implementation using Axum.

use crate::ws::serve_socket;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tbrpc::{ServerConfig, ServerRouter};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub connections: usize,
}

async fn handle_health(State(router): State<ServerRouter>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: router.connection_count(),
    })
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(router): State<ServerRouter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(router, socket))
}

/// Build the axum app serving `router` on the WebSocket path.
pub fn app(router: ServerRouter) -> Router {
    // Browser clients connect from arbitrary origins during development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(ServerConfig::HEALTH_PATH, get(handle_health))
        .route(ServerConfig::WS_PATH, get(handle_upgrade))
        .layer(cors)
        .with_state(router)
}

/// Start the WebSocket server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(router: ServerRouter, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    let service = app(router);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, service).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
