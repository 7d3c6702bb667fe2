//! Tunnel server: relays public HTTP requests to agents connected over
//! WebSocket, multiplexing concurrent requests per agent connection.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod provisioner;
pub mod registry;
pub mod session;
pub mod state;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Routes: `/ws` for agents, `/api/tunnels` for inspection, everything else
/// is public tunnel traffic.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route(
            "/api/tunnels",
            get(api::list_tunnels).layer(CorsLayer::permissive()),
        )
        .fallback(gateway::handle_public_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
