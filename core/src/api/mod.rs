pub mod cluster;
pub mod guard;
pub mod settings;
pub mod status;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::error::CoreError;

pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        // Bootstrap
        .route("/setup", post(cluster::setup))
        // Cluster membership
        .route("/cluster/join", post(cluster::join))
        .route("/cluster/invite", post(cluster::invite))
        .route("/cluster/heartbeat", post(cluster::heartbeat))
        .route("/cluster/sync", post(cluster::sync))
        // Status
        .route("/status", get(status::status))
        .route("/reload", get(status::reload))
        // Settings
        .route(
            "/settings",
            get(settings::list_settings).post(settings::update_settings),
        )
        .route("/settings/:serial", get(settings::get_settings))
        .route("/ca/certificate", get(settings::ca_certificate))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    coordinator.clone(),
                    guard::guard_routes,
                )),
        )
        .with_state(coordinator)
}

async fn not_found() -> CoreError {
    CoreError::NotFound
}

/// JSON body extractor that reports malformed bodies as schema violations
pub struct Payload<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Payload<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Payload(value)),
            Err(rejection) => Err(CoreError::SchemaViolation(rejection.body_text())),
        }
    }
}
