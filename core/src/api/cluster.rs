use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::Payload;
use crate::coordinator::Coordinator;
use crate::error::CoreResult;
use crate::types::{
    HeartbeatMessage, InviteRequest, JoinRequest, JoinResponse, SettingsPayload, SetupResponse,
    SyncRequest,
};

/// POST /setup - Bootstrap a new cluster on an ephemeral node
pub async fn setup(
    State(coordinator): State<Arc<Coordinator>>,
    headers: HeaderMap,
    Payload(body): Payload<Value>,
) -> CoreResult<Json<SetupResponse>> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(Json(coordinator.setup(body, host).await?))
}

/// POST /cluster/join - Admit a node into the cluster (leader only)
pub async fn join(
    State(coordinator): State<Arc<Coordinator>>,
    Payload(req): Payload<JoinRequest>,
) -> CoreResult<Json<JoinResponse>> {
    info!("Join request from {} as {}", req.you, req.role.as_str());
    Ok(Json(coordinator.handle_join(req).await?))
}

/// POST /cluster/invite - Ask an ephemeral node to join
pub async fn invite(
    State(coordinator): State<Arc<Coordinator>>,
    Payload(req): Payload<InviteRequest>,
) -> CoreResult<(StatusCode, Json<Value>)> {
    info!("Invited by {} to join cluster {}", req.join, req.cluster.uuid);
    coordinator.handle_invite(req).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "result": "accepted" }))))
}

/// POST /cluster/heartbeat - Exchange liveness and cluster state
pub async fn heartbeat(
    State(coordinator): State<Arc<Coordinator>>,
    Payload(msg): Payload<HeartbeatMessage>,
) -> CoreResult<Json<HeartbeatMessage>> {
    Ok(Json(coordinator.handle_heartbeat(msg).await?))
}

/// POST /cluster/sync - Hand the authoritative settings to a follower
pub async fn sync(
    State(coordinator): State<Arc<Coordinator>>,
    Payload(req): Payload<SyncRequest>,
) -> CoreResult<Json<SettingsPayload>> {
    Ok(Json(coordinator.handle_sync(req).await?))
}
