//! flowgrid-api: REST API for flowgrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | List the service pool |
//! | GET | `/api/v1/services/{id}` | Get a service |
//! | PUT | `/api/v1/services/{id}` | Create or replace a service (validated) |
//! | DELETE | `/api/v1/services/{id}` | Remove a service and stop watching it |
//! | PUT | `/api/v1/services/{id}/roles/{role}/metrics` | Push the role's latest metric values |
//! | POST | `/api/v1/services/{id}/roles/{role}/state` | Compare-and-set the role's state |
//! | POST | `/api/v1/services/{id}/roles/{role}/cardinality` | Request a new cardinality |
//! | POST | `/api/v1/services/{id}/roles/{role}/deploy` | Create missing nodes |
//! | POST | `/api/v1/services/{id}/roles/{role}/shutdown` | Remove surplus nodes |
//! | POST | `/api/v1/services/{id}/roles/{role}/recover` | Retry the role's failed transition |
//! | POST | `/api/v1/services/{id}/roles/{role}/action` | Schedule an action on every node |
//! | POST | `/api/v1/services/{id}/roles/{role}/chown` | Change the owner of every node |
//! | GET | `/api/v1/watch` | Services currently watched |
//! | POST | `/api/v1/services/{id}/watch` | Start watching a service |
//! | DELETE | `/api/v1/services/{id}/watch` | Stop watching a service |
//! | POST | `/api/v1/services/{id}/roles/{role}/nodes/{node}/watch` | Watch one more node |
//! | DELETE | `/api/v1/services/{id}/roles/{role}/nodes/{node}/watch` | Stop watching a node |

pub mod handlers;
pub mod role_handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tokio::sync::{Mutex, OwnedMutexGuard};

use flowgrid_role::RoleOperator;
use flowgrid_state::{ServiceId, StateStore};
use flowgrid_watchdog::Watchdog;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub watchdog: Arc<Watchdog>,
    pub operator: Arc<RoleOperator>,
    pub locks: RoleLocks,
}

/// One async mutex per `(service, role)`. A driver-backed role operation
/// holds it from loading the service until its result is written back.
#[derive(Clone, Default)]
pub struct RoleLocks {
    slots: Arc<Mutex<HashMap<(ServiceId, String), Arc<Mutex<()>>>>>,
}

impl RoleLocks {
    pub async fn lock(&self, service_id: ServiceId, role: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(
                slots
                    .entry((service_id, role.to_string()))
                    .or_default(),
            )
        };
        slot.lock_owned().await
    }

    /// Drop the slots of a deleted service.
    pub async fn forget(&self, service_id: ServiceId) {
        self.slots.lock().await.retain(|(id, _), _| *id != service_id);
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route(
            "/services/{id}",
            get(handlers::get_service)
                .put(handlers::put_service)
                .delete(handlers::delete_service),
        )
        .route(
            "/services/{id}/roles/{role}/metrics",
            put(handlers::put_role_metrics),
        )
        .route(
            "/services/{id}/roles/{role}/state",
            post(handlers::set_role_state),
        )
        .route(
            "/services/{id}/roles/{role}/cardinality",
            post(role_handlers::set_cardinality),
        )
        .route(
            "/services/{id}/roles/{role}/deploy",
            post(role_handlers::deploy_role),
        )
        .route(
            "/services/{id}/roles/{role}/shutdown",
            post(role_handlers::shutdown_role),
        )
        .route(
            "/services/{id}/roles/{role}/recover",
            post(role_handlers::recover_role),
        )
        .route(
            "/services/{id}/roles/{role}/action",
            post(role_handlers::schedule_action),
        )
        .route(
            "/services/{id}/roles/{role}/chown",
            post(role_handlers::chown_role),
        )
        .route("/watch", get(handlers::list_watched))
        .route(
            "/services/{id}/watch",
            post(handlers::start_watching).delete(handlers::stop_watching),
        )
        .route(
            "/services/{id}/roles/{role}/nodes/{node}/watch",
            post(handlers::watch_node).delete(handlers::update_node),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
