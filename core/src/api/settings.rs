use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use std::sync::Arc;

use super::Payload;
use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::types::{
    CaCertificateResponse, SettingsListResponse, SettingsResponse, SettingsVersionResponse,
};

/// POST /settings - Store and deploy a new settings version (leader only)
pub async fn update_settings(
    State(coordinator): State<Arc<Coordinator>>,
    Payload(body): Payload<Value>,
) -> CoreResult<Json<SettingsResponse>> {
    Ok(Json(coordinator.update_settings(body).await?))
}

/// GET /settings - Serials of every stored settings version
pub async fn list_settings(
    State(coordinator): State<Arc<Coordinator>>,
) -> CoreResult<Json<SettingsListResponse>> {
    Ok(Json(coordinator.list_settings().await?))
}

/// GET /settings/:serial - One stored version, or `current` for the running one
pub async fn get_settings(
    State(coordinator): State<Arc<Coordinator>>,
    Path(serial): Path<String>,
) -> CoreResult<Json<SettingsVersionResponse>> {
    let serial = match serial.as_str() {
        "current" => None,
        other => Some(other.parse::<i64>().map_err(|_| {
            CoreError::SchemaViolation(format!("settings serial must be a number, got {}", other))
        })?),
    };
    Ok(Json(coordinator.settings_version(serial).await?))
}

/// GET /ca/certificate - Root certificate of the cluster CA
pub async fn ca_certificate(
    State(coordinator): State<Arc<Coordinator>>,
) -> CoreResult<Json<CaCertificateResponse>> {
    Ok(Json(coordinator.ca_certificate().await?))
}
