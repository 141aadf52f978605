//! HTTP signaling surface
//!
//! This module provides the REST API the browser viewer talks to:
//! - `POST /offer` - SDP offer/answer exchange
//! - `GET /connections` - registry snapshot
//! - `GET /healthz` - liveness probe
//! - `GET /` - built-in browser viewer page

pub mod offer;

use std::sync::Arc;

use axum::{
    extract::State,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::peer::{ConnectionInfo, PeerManager};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Connection registry and negotiation entry point
    pub manager: Arc<PeerManager>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(manager: Arc<PeerManager>) -> Self {
        Self { manager }
    }
}

/// Build the HTTP signaling router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - allow any origin so the viewer page can be
    // served from elsewhere during development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/offer", post(offer::exchange_offer))
        .route("/connections", get(list_connections))
        .route("/healthz", get(health_check))
        .route("/", get(index))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Built-in viewer page
async fn index() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Registry snapshot endpoint
async fn list_connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.manager.list_connections().await)
}
