//! REST API handlers for driver-backed role operations.
//!
//! A role operation runs against a copy of the stored service; the role's
//! node list, name sequence and the service log are then written back in
//! one transaction. The role's lock in [`RoleLocks`](crate::RoleLocks) is
//! held from the load to the write-back, so two operations on one role never
//! work from the same copy. Nodes the operation created or removed are
//! handed to the watchdog when the service is being watched.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use flowgrid_role::{RoleError, RoleResult};
use flowgrid_state::*;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, state_error};

fn role_error_status(e: &RoleError) -> StatusCode {
    match e {
        RoleError::RoleNotFound(_) => StatusCode::NOT_FOUND,
        RoleError::Blocked { .. } | RoleError::RoleDone(_) | RoleError::NoScaleWay(_) => {
            StatusCode::CONFLICT
        }
        RoleError::Validation(_) => StatusCode::BAD_REQUEST,
        RoleError::Partial(_) => StatusCode::BAD_GATEWAY,
    }
}

fn role_response<T: serde::Serialize>(result: RoleResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(RoleError::Partial(failure)) => (
            StatusCode::BAD_GATEWAY,
            ApiResponse::failed_with(failure.completed, &failure.reason),
        )
            .into_response(),
        Err(e) => error_response(&e.to_string(), role_error_status(&e)),
    }
}

fn load(state: &ApiState, id: ServiceId) -> Result<Service, Response> {
    match state.store.get_service(id) {
        Ok(Some(service)) => Ok(service),
        Ok(None) => Err(error_response("service not found", StatusCode::NOT_FOUND)),
        Err(e) => Err(state_error(&e)),
    }
}

/// Persist what a role operation changed and sync the watchdog.
async fn commit(
    state: &ApiState,
    before: &[NodeId],
    service: &Service,
    role: &str,
) -> Result<(), Response> {
    let written = state.store.update_service(service.id, |stored| {
        if let (Some(dst), Some(src)) = (stored.role_mut(role), service.role(role)) {
            dst.nodes = src.nodes.clone();
            dst.last_vmname = src.last_vmname;
        }
        stored.log = service.log.clone();
        Ok(())
    });
    if let Err(e) = written {
        warn!(service_id = service.id, role, error = %e, "role operation result not persisted");
        return Err(state_error(&e));
    }

    if !state.watchdog.is_watching(service.id).await {
        return Ok(());
    }
    let after = node_ids(service, role);
    for node in after.iter().filter(|n| !before.contains(n)) {
        if let Err(e) = state.watchdog.watch_node(service.id, role, *node).await {
            warn!(service_id = service.id, role, node_id = node, error = %e, "new node not watched");
        }
    }
    for node in before.iter().filter(|n| !after.contains(n)) {
        state.watchdog.update_node(service.id, role, *node).await;
    }
    Ok(())
}

fn node_ids(service: &Service, role: &str) -> Vec<NodeId> {
    service.role(role).map(Role::node_ids).unwrap_or_default()
}

// ── Cardinality ────────────────────────────────────────────────

/// Cardinality request body.
#[derive(serde::Deserialize)]
pub struct CardinalityRequest {
    pub cardinality: u32,
    #[serde(default)]
    pub force: bool,
}

/// POST /api/v1/services/:id/roles/:role/cardinality
pub async fn set_cardinality(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
    Json(req): Json<CardinalityRequest>,
) -> impl IntoResponse {
    let result = state.store.update_service(id, |service| {
        let r = service
            .role_mut(&role)
            .ok_or_else(|| StateError::NotFound(role_key(id, &role)))?;
        r.update(req.cardinality, req.force)?;
        Ok(r.cardinality)
    });
    match result {
        Ok(cardinality) => ApiResponse::ok(serde_json::json!({
            "role": role,
            "cardinality": cardinality,
        }))
        .into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Driver-backed operations ───────────────────────────────────

/// POST /api/v1/services/:id/roles/:role/deploy
pub async fn deploy_role(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
) -> impl IntoResponse {
    let _guard = state.locks.lock(id, &role).await;
    let mut service = match load(&state, id) {
        Ok(service) => service,
        Err(resp) => return resp,
    };
    let before = node_ids(&service, &role);
    let result = state.operator.deploy(&mut service, &role).await;
    if let Err(resp) = commit(&state, &before, &service, &role).await {
        return resp;
    }
    role_response(result)
}

/// Shutdown request body.
#[derive(serde::Deserialize, Default)]
pub struct ShutdownRequest {
    /// Re-submit VMs stuck in a failure state instead of terminating them.
    #[serde(default)]
    pub recover: bool,
}

/// POST /api/v1/services/:id/roles/:role/shutdown
pub async fn shutdown_role(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
    Json(req): Json<ShutdownRequest>,
) -> impl IntoResponse {
    let _guard = state.locks.lock(id, &role).await;
    let mut service = match load(&state, id) {
        Ok(service) => service,
        Err(resp) => return resp,
    };
    let before = node_ids(&service, &role);
    let result = state
        .operator
        .shutdown(&mut service, &role, req.recover)
        .await;
    if let Err(resp) = commit(&state, &before, &service, &role).await {
        return resp;
    }
    role_response(result)
}

/// POST /api/v1/services/:id/roles/:role/recover
pub async fn recover_role(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
) -> impl IntoResponse {
    let _guard = state.locks.lock(id, &role).await;
    let mut service = match load(&state, id) {
        Ok(service) => service,
        Err(resp) => return resp,
    };
    let before = node_ids(&service, &role);
    let result = state.operator.recover(&mut service, &role).await;
    if let Err(RoleError::Blocked { state: role_state, .. }) = &result {
        debug!(service_id = id, %role, state = %role_state, "recovery not applicable");
    }
    if let Err(resp) = commit(&state, &before, &service, &role).await {
        return resp;
    }
    role_response(result)
}

/// Batch action request body.
#[derive(serde::Deserialize)]
pub struct ActionRequest {
    pub action: ScheduleAction,
    /// Seconds between batches.
    #[serde(default)]
    pub period: Option<u64>,
    /// Nodes per batch.
    #[serde(default)]
    pub number: Option<u32>,
}

/// POST /api/v1/services/:id/roles/:role/action
pub async fn schedule_action(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
    Json(req): Json<ActionRequest>,
) -> impl IntoResponse {
    let _guard = state.locks.lock(id, &role).await;
    let mut service = match load(&state, id) {
        Ok(service) => service,
        Err(resp) => return resp,
    };
    let before = node_ids(&service, &role);
    let result = state
        .operator
        .batch_action(&mut service, &role, req.action, req.period, req.number, epoch_secs())
        .await;
    if let Err(resp) = commit(&state, &before, &service, &role).await {
        return resp;
    }
    role_response(result)
}

/// Chown request body.
#[derive(serde::Deserialize)]
pub struct ChownRequest {
    pub uid: u32,
    pub gid: u32,
}

/// POST /api/v1/services/:id/roles/:role/chown
pub async fn chown_role(
    State(state): State<ApiState>,
    Path((id, role)): Path<(ServiceId, String)>,
    Json(req): Json<ChownRequest>,
) -> impl IntoResponse {
    let _guard = state.locks.lock(id, &role).await;
    let mut service = match load(&state, id) {
        Ok(service) => service,
        Err(resp) => return resp,
    };
    let before = node_ids(&service, &role);
    let result = state
        .operator
        .chown(&mut service, &role, req.uid, req.gid)
        .await;
    if let Err(resp) = commit(&state, &before, &service, &role).await {
        return resp;
    }
    role_response(result)
}
