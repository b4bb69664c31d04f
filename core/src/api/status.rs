use axum::{extract::State, Json};
use std::sync::Arc;

use crate::coordinator::Coordinator;
use crate::types::{ReloadResponse, StatusResponse};

/// GET /status - Node and cluster status
pub async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<StatusResponse> {
    Json(coordinator.status().await)
}

/// GET /reload - Status plus settings, keys and presets
pub async fn reload(State(coordinator): State<Arc<Coordinator>>) -> Json<ReloadResponse> {
    Json(coordinator.reload().await)
}
