//! Mode gates in front of the routes
//!
//! An ephemeral node only answers the routes it needs to be set up or
//! invited. While settings are being applied a node only answers status
//! and cluster traffic.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::coordinator::Coordinator;
use crate::error::CoreError;

const ROUTES: &[(&str, &str)] = &[
    ("POST", "/setup"),
    ("POST", "/cluster/join"),
    ("POST", "/cluster/invite"),
    ("POST", "/cluster/heartbeat"),
    ("POST", "/cluster/sync"),
    ("GET", "/status"),
    ("GET", "/reload"),
    ("GET", "/settings"),
    ("POST", "/settings"),
    ("GET", "/settings/:serial"),
    ("GET", "/ca/certificate"),
];

const EPHEMERAL_ROUTES: &[(&str, &str)] = &[
    ("GET", "/status"),
    ("GET", "/reload"),
    ("POST", "/setup"),
    ("POST", "/cluster/invite"),
];

/// Routes that only make sense before a node has an identity
const EPHEMERAL_ONLY_ROUTES: &[(&str, &str)] = &[("POST", "/setup"), ("POST", "/cluster/invite")];

const RELOADING_ROUTES: &[(&str, &str)] = &[
    ("GET", "/status"),
    ("POST", "/cluster/heartbeat"),
    ("POST", "/cluster/sync"),
];

/// Map a request path onto the route pattern it is served by
fn route_pattern(path: &str) -> &str {
    match path.strip_prefix("/settings/") {
        Some(serial) if !serial.is_empty() && !serial.contains('/') => "/settings/:serial",
        _ => path,
    }
}

enum Gate {
    Pass,
    Reject(CoreError),
}

fn gate((method, path): (&str, &str), ephemeral: bool, reloading: bool) -> Gate {
    let route = (method, route_pattern(path));
    if !ROUTES.contains(&route) {
        return Gate::Pass;
    }
    if ephemeral {
        if EPHEMERAL_ROUTES.contains(&route) {
            return Gate::Pass;
        }
        return Gate::Reject(CoreError::EphemeralProhibited);
    }
    if EPHEMERAL_ONLY_ROUTES.contains(&route) {
        return Gate::Reject(CoreError::EphemeralRequired);
    }
    if reloading && !RELOADING_ROUTES.contains(&route) {
        return Gate::Reject(CoreError::ReloadingProhibited);
    }
    Gate::Pass
}

pub async fn guard_routes(
    State(coordinator): State<Arc<Coordinator>>,
    req: Request,
    next: Next,
) -> Response {
    let ephemeral = coordinator.is_ephemeral().await;
    let reloading = coordinator.is_reloading();

    let verdict = gate((req.method().as_str(), req.uri().path()), ephemeral, reloading);
    match verdict {
        Gate::Pass => next.run(req).await,
        Gate::Reject(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(route: (&str, &str), ephemeral: bool, reloading: bool) -> Option<&'static str> {
        match gate(route, ephemeral, reloading) {
            Gate::Pass => None,
            Gate::Reject(err) => Some(err.code()),
        }
    }

    #[test]
    fn test_ephemeral_allowlist() {
        assert_eq!(code(("GET", "/status"), true, false), None);
        assert_eq!(code(("POST", "/setup"), true, false), None);
        assert_eq!(code(("POST", "/cluster/invite"), true, false), None);
        assert_eq!(
            code(("POST", "/cluster/heartbeat"), true, false),
            Some("morio.core.ephemeral.prohibited")
        );
        assert_eq!(
            code(("POST", "/settings"), true, false),
            Some("morio.core.ephemeral.prohibited")
        );
    }

    #[test]
    fn test_setup_requires_ephemeral() {
        assert_eq!(
            code(("POST", "/setup"), false, false),
            Some("morio.core.ephemeral.required")
        );
        assert_eq!(
            code(("POST", "/setup"), false, true),
            Some("morio.core.ephemeral.required")
        );
    }

    #[test]
    fn test_reloading_allowlist() {
        assert_eq!(code(("GET", "/status"), false, true), None);
        assert_eq!(code(("POST", "/cluster/heartbeat"), false, true), None);
        assert_eq!(
            code(("GET", "/reload"), false, true),
            Some("morio.core.reloading.prohibited")
        );
        assert_eq!(
            code(("POST", "/cluster/join"), false, true),
            Some("morio.core.reloading.prohibited")
        );
    }

    #[test]
    fn test_settings_versions_need_identity() {
        assert_eq!(
            code(("GET", "/settings/1700000000000"), true, false),
            Some("morio.core.ephemeral.prohibited")
        );
        assert_eq!(
            code(("GET", "/settings"), true, false),
            Some("morio.core.ephemeral.prohibited")
        );
        assert_eq!(code(("GET", "/settings/current"), false, false), None);
        assert_eq!(
            code(("GET", "/settings/42"), false, true),
            Some("morio.core.reloading.prohibited")
        );
        assert_eq!(code(("GET", "/settings/42/data"), true, true), None);
    }

    #[test]
    fn test_unknown_routes_fall_through() {
        assert_eq!(code(("GET", "/nope"), true, true), None);
        assert_eq!(code(("DELETE", "/status"), false, false), None);
    }
}
