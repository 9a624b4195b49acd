//! REST API handlers for the service pool, metrics and the watchdog.
//!
//! Each handler reads/writes via `StateStore` or the `Watchdog` and returns
//! JSON responses in the [`ApiResponse`] envelope.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use flowgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    /// A failure that still carries data, e.g. the nodes a batch completed.
    pub(crate) fn failed_with(data: T, msg: &str) -> Json<Self> {
        Json(Self {
            success: false,
            data: Some(data),
            error: Some(msg.to_string()),
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn service_not_found() -> Response {
    error_response("service not found", StatusCode::NOT_FOUND)
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_services() {
        Ok(services) => ApiResponse::ok(services).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/services/:id
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<ServiceId>,
) -> impl IntoResponse {
    match state.store.get_service(id) {
        Ok(Some(service)) => ApiResponse::ok(service).into_response(),
        Ok(None) => service_not_found(),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/services/:id
pub async fn put_service(
    State(state): State<ApiState>,
    Path(id): Path<ServiceId>,
    Json(service): Json<Service>,
) -> impl IntoResponse {
    if service.id != id {
        return error_response(
            &format!("body names service {} but path names {id}", service.id),
            StatusCode::BAD_REQUEST,
        );
    }
    if let Err(e) = service.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    match state.store.put_service(&service) {
        Ok(stored) => {
            info!(service_id = id, name = %stored.name, "service stored");
            ApiResponse::ok(stored).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/services/:id
pub async fn delete_service(
    State(state): State<ApiState>,
    Path(id): Path<ServiceId>,
) -> impl IntoResponse {
    match state.store.delete_service(id) {
        Ok(true) => {
            state.watchdog.stop_watching(id).await;
            state.locks.forget(id).await;
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => service_not_found(),
        Err(e) => state_error(&e),
    }
}

// ── Role state ─────────────────────────────────────────────────

/// Role state change body.
#[derive(serde::Deserialize)]
pub struct RoleStateRequest {
    pub state: RoleState,
    /// States the role must currently be in; empty accepts any.
    #[serde(default)]
    pub from: Vec<RoleState>,
}

/// POST /api/v1/services/:id/roles/:role/state
pub async fn set_role_state(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
    Json(req): Json<RoleStateRequest>,
) -> impl IntoResponse {
    let allowed = if req.from.is_empty() {
        RoleState::ALL
    } else {
        req.from.as_slice()
    };
    match state.store.transition_role(id, &role, allowed, req.state) {
        Ok(true) => {
            info!(service_id = id, %role, state = %req.state, "role state set");
            ApiResponse::ok(serde_json::json!({
                "role": role,
                "state": req.state,
            }))
            .into_response()
        }
        Ok(false) => error_response(
            &format!("role {role} is not in any of the expected states"),
            StatusCode::CONFLICT,
        ),
        Err(e) => state_error(&e),
    }
}

// ── Metrics ────────────────────────────────────────────────────

/// Metric push body.
#[derive(serde::Deserialize)]
pub struct MetricsRequest {
    /// Observation time; defaults to now.
    #[serde(default)]
    pub epoch: Option<u64>,
    pub values: HashMap<String, f64>,
}

/// PUT /api/v1/services/:id/roles/:role/metrics
pub async fn put_role_metrics(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
    Json(req): Json<MetricsRequest>,
) -> impl IntoResponse {
    match state.store.get_service(id) {
        Ok(Some(service)) if service.role(&role).is_some() => {}
        Ok(Some(_)) => return error_response("role not found", StatusCode::NOT_FOUND),
        Ok(None) => return service_not_found(),
        Err(e) => return state_error(&e),
    }

    let metrics = RoleMetrics {
        service_id: id,
        role,
        epoch: req.epoch.unwrap_or_else(epoch_secs),
        values: req.values,
    };
    match state.store.put_role_metrics(&metrics) {
        Ok(()) => ApiResponse::ok(metrics).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Watchdog ───────────────────────────────────────────────────

/// GET /api/v1/watch
pub async fn list_watched(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.watchdog.watched().await)
}

/// POST /api/v1/services/:id/watch
pub async fn start_watching(
    State(state): State<ApiState>,
    Path(id): Path<ServiceId>,
) -> impl IntoResponse {
    let service = match state.store.get_service(id) {
        Ok(Some(service)) => service,
        Ok(None) => return service_not_found(),
        Err(e) => return state_error(&e),
    };
    match state.watchdog.start_watching(&service).await {
        Ok(nodes) => ApiResponse::ok(serde_json::json!({
            "service_id": id,
            "nodes": nodes,
        }))
        .into_response(),
        Err(e) => {
            warn!(service_id = id, error = %e, "failed to start watching");
            error_response(&e.to_string(), StatusCode::BAD_GATEWAY)
        }
    }
}

/// DELETE /api/v1/services/:id/watch
pub async fn stop_watching(
    State(state): State<ApiState>,
    Path(id): Path<ServiceId>,
) -> impl IntoResponse {
    if state.watchdog.stop_watching(id).await {
        ApiResponse::ok("stopped").into_response()
    } else {
        error_response("service not watched", StatusCode::NOT_FOUND)
    }
}

/// POST /api/v1/services/:id/roles/:role/nodes/:node/watch
pub async fn watch_node(
    State(state): State<ApiState>,
    Path((id, role, node)): Path<(ServiceId, String, NodeId)>,
) -> impl IntoResponse {
    match state.watchdog.watch_node(id, &role, node).await {
        Ok(added) => ApiResponse::ok(serde_json::json!({ "node_id": node, "added": added }))
            .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_GATEWAY),
    }
}

/// DELETE /api/v1/services/:id/roles/:role/nodes/:node/watch
pub async fn update_node(
    State(state): State<ApiState>,
    Path((id, role, node)): Path<(ServiceId, String, NodeId)>,
) -> impl IntoResponse {
    if state.watchdog.update_node(id, &role, node).await {
        ApiResponse::ok(serde_json::json!({ "node_id": node })).into_response()
    } else {
        error_response("node not watched", StatusCode::NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_json, service, test_state};

    #[tokio::test]
    async fn list_services_empty() {
        let (state, _) = test_state();
        let resp = list_services(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn put_and_get_service() {
        let (state, _) = test_state();
        let resp = put_service(State(state.clone()), Path(1), Json(service(1))).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_service(State(state), Path(1)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["name"], "shop");
    }

    #[tokio::test]
    async fn put_rejects_mismatched_id() {
        let (state, _) = test_state();
        let resp = put_service(State(state), Path(2), Json(service(1))).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_rejects_invalid_service() {
        let (state, _) = test_state();
        let mut svc = service(1);
        svc.roles.push(svc.roles[0].clone());
        let resp = put_service(State(state.clone()), Path(1), Json(svc)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
        assert!(state.store.get_service(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn put_into_scaling_drops_policy_windows() {
        let (state, _) = test_state();
        let mut svc = service(1);
        svc.roles[0].state = RoleState::Running;
        svc.roles[0]
            .elasticity_policies
            .push(ElasticityPolicy::new(PolicyKind::Change { adjust: 1 }, "CPU > 80"));
        svc.roles[0].elasticity_policies[0].record(true, 10);
        state.store.put_service(&svc).unwrap();

        svc.roles[0].state = RoleState::Scaling;
        let resp = put_service(State(state.clone()), Path(1), Json(svc)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["roles"][0]["state"], "SCALING");

        let stored = state.store.get_service(1).unwrap().unwrap();
        assert!(stored.roles[0].elasticity_policies[0].true_evals.is_empty());
    }

    #[tokio::test]
    async fn role_state_is_compare_and_set() {
        let (state, _) = test_state();
        let mut svc = service(1);
        svc.roles[0].state = RoleState::Running;
        svc.roles[0]
            .elasticity_policies
            .push(ElasticityPolicy::new(PolicyKind::Change { adjust: 1 }, "CPU > 80"));
        svc.roles[0].elasticity_policies[0].record(true, 10);
        state.store.put_service(&svc).unwrap();

        let req = RoleStateRequest {
            state: RoleState::Scaling,
            from: vec![RoleState::Running],
        };
        let resp = set_role_state(State(state.clone()), Path((1, "web".to_string())), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["state"], "SCALING");
        let stored = state.store.get_service(1).unwrap().unwrap();
        assert_eq!(stored.roles[0].state, RoleState::Scaling);
        assert!(stored.roles[0].elasticity_policies[0].true_evals.is_empty());

        let req = RoleStateRequest {
            state: RoleState::Scaling,
            from: vec![RoleState::Running],
        };
        let resp = set_role_state(State(state.clone()), Path((1, "web".to_string())), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);

        let req = RoleStateRequest {
            state: RoleState::Running,
            from: Vec::new(),
        };
        let resp = set_role_state(State(state.clone()), Path((1, "web".to_string())), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let req = RoleStateRequest {
            state: RoleState::Running,
            from: Vec::new(),
        };
        let resp = set_role_state(State(state), Path((1, "db".to_string())), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_nonexistent_service() {
        let (state, _) = test_state();
        let resp = get_service(State(state), Path(9)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_service_and_missing() {
        let (state, _) = test_state();
        state.store.put_service(&service(1)).unwrap();

        let resp = delete_service(State(state.clone()), Path(1)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = delete_service(State(state), Path(1)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_push_is_stored() {
        let (state, _) = test_state();
        state.store.put_service(&service(1)).unwrap();

        let req = MetricsRequest {
            epoch: Some(50),
            values: HashMap::from([("CPU".to_string(), 80.0)]),
        };
        let resp = put_role_metrics(State(state.clone()), Path((1, "web".to_string())), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let stored = state.store.latest_role_metrics(1, "web").unwrap().unwrap();
        assert_eq!(stored.epoch, 50);
        assert_eq!(stored.value("CPU"), Some(80.0));
    }

    #[tokio::test]
    async fn metrics_for_unknown_role_is_not_found() {
        let (state, _) = test_state();
        state.store.put_service(&service(1)).unwrap();
        let req = MetricsRequest {
            epoch: None,
            values: HashMap::new(),
        };
        let resp = put_role_metrics(State(state), Path((1, "nope".to_string())), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn watch_lifecycle() {
        let (state, _) = test_state();
        let mut svc = service(1);
        svc.roles[0].nodes = vec![Node::new(100, None)];
        state.store.put_service(&svc).unwrap();

        let resp = start_watching(State(state.clone()), Path(1)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["nodes"], 1);

        let resp = list_watched(State(state.clone())).await.into_response();
        assert_eq!(body_json(resp).await["data"], serde_json::json!([1]));

        let resp = watch_node(State(state.clone()), Path((1, "web".to_string(), 101))).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = update_node(State(state.clone()), Path((1, "web".to_string(), 101))).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = update_node(State(state.clone()), Path((1, "web".to_string(), 101))).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);

        let resp = stop_watching(State(state.clone()), Path(1)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        let resp = stop_watching(State(state), Path(1)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn watching_unknown_service_is_not_found() {
        let (state, _) = test_state();
        let resp = start_watching(State(state), Path(5)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }
}
