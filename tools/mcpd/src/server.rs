//! HTTP front end: JSON-RPC over `POST /mcp` plus health and status probes.
//!
//! Connections are handled concurrently, but every `/mcp` request funnels
//! through the dispatcher and from there through the single-slot serial
//! transactor, so tool calls serialize at the device.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::dispatch::Dispatcher;
use crate::rpc::JsonRpcResponse;
use crate::supervisor::StateCell;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub state: StateCell,
}

pub fn build_router(app: AppState) -> Router {
    // Browser-based MCP clients talk to us cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/mcp", post(mcp))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(cors)
        .with_state(app)
}

/// The body is taken as raw text so that malformed JSON maps to a JSON-RPC
/// parse error instead of an HTTP-level rejection.
async fn mcp(State(app): State<AppState>, body: String) -> Json<JsonRpcResponse> {
    Json(app.dispatcher.dispatch(&body).await)
}

#[derive(Serialize)]
struct StatusResponse {
    state: &'static str,
    message: String,
    device_id: Option<String>,
    ready: bool,
}

async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    let state = app.state.snapshot();
    Json(StatusResponse {
        state: state.name(),
        message: state.status_message(),
        device_id: state.device_id().map(str::to_string),
        ready: state.is_ready(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
