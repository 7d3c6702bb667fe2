//! # REST API Endpoints
//!
//! Provides HTTP API endpoints for querying server state.
//! Currently only exposes a list of active tunnels.

use crate::registry::TunnelSummary;
use crate::state::AppState;
use axum::{extract::State, Json};

/// `GET /api/tunnels`: returns a JSON array of all currently active tunnels,
/// with their public URL and the number of requests waiting on each.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelSummary>> {
    Json(state.registry.list())
}
