//! VM driver client for a driver service speaking JSON over HTTP.
//!
//! | Call | Request |
//! |---|---|
//! | info | `GET /v1/vms/{id}` |
//! | instantiate | `POST /v1/vms` |
//! | terminate | `POST /v1/vms/{id}/terminate` `{"hard"}` |
//! | delete | `DELETE /v1/vms/{id}` |
//! | recover | `POST /v1/vms/{id}/recover` `{"mode"}` |
//! | resume | `POST /v1/vms/{id}/resume` |
//! | chown | `POST /v1/vms/{id}/chown` `{"uid","gid"}` |
//! | schedule | `POST /v1/vms/{id}/sched_actions` |

use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use flowgrid_core::http::{Endpoint, HttpResponse, send_json};
use flowgrid_state::{NodeId, RecoverMode};

use crate::driver::{Instantiate, SchedAction, VmDriver, VmInfo};
use crate::error::{DriverError, DriverResult};

#[derive(Deserialize)]
struct Created {
    id: NodeId,
}

pub struct HttpVmDriver {
    endpoint: Endpoint,
    timeout: Duration,
}

impl HttpVmDriver {
    pub fn new(endpoint: &str, timeout: Duration) -> DriverResult<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            timeout,
        })
    }

    async fn call(
        &self,
        op: &'static str,
        id: Option<NodeId>,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> DriverResult<HttpResponse> {
        let resp = send_json(&self.endpoint, method, path, &[], body, self.timeout).await?;
        if resp.status == StatusCode::NOT_FOUND {
            if let Some(id) = id {
                return Err(DriverError::NotFound(id));
            }
        }
        if !resp.status.is_success() {
            return Err(DriverError::Rejected {
                op,
                reason: format!("{}: {}", resp.status, String::from_utf8_lossy(&resp.body)),
            });
        }
        Ok(resp)
    }

    async fn post_vm(
        &self,
        op: &'static str,
        id: NodeId,
        action: &str,
        body: serde_json::Value,
    ) -> DriverResult<()> {
        let path = format!("/v1/vms/{id}/{action}");
        self.call(op, Some(id), Method::POST, &path, Some(&body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl VmDriver for HttpVmDriver {
    async fn info(&self, id: NodeId) -> DriverResult<VmInfo> {
        let resp = self
            .call("info", Some(id), Method::GET, &format!("/v1/vms/{id}"), None)
            .await?;
        resp.json().map_err(|e| DriverError::Decode(e.to_string()))
    }

    async fn instantiate(&self, request: &Instantiate) -> DriverResult<NodeId> {
        let body = serde_json::to_value(request).map_err(|e| DriverError::Decode(e.to_string()))?;
        let resp = self
            .call("instantiate", None, Method::POST, "/v1/vms", Some(&body))
            .await?;
        let created: Created = resp.json().map_err(|e| DriverError::Decode(e.to_string()))?;
        Ok(created.id)
    }

    async fn terminate(&self, id: NodeId, hard: bool) -> DriverResult<()> {
        let op = if hard { "terminate-hard" } else { "terminate" };
        self.post_vm(op, id, "terminate", json!({ "hard": hard })).await
    }

    async fn delete(&self, id: NodeId) -> DriverResult<()> {
        self.call("delete", Some(id), Method::DELETE, &format!("/v1/vms/{id}"), None)
            .await
            .map(|_| ())
    }

    async fn recover(&self, id: NodeId, mode: RecoverMode) -> DriverResult<()> {
        self.post_vm("recover", id, "recover", json!({ "mode": mode })).await
    }

    async fn resume(&self, id: NodeId) -> DriverResult<()> {
        self.post_vm("resume", id, "resume", json!({})).await
    }

    async fn chown(&self, id: NodeId, uid: u32, gid: u32) -> DriverResult<()> {
        self.post_vm("chown", id, "chown", json!({ "uid": uid, "gid": gid }))
            .await
    }

    async fn schedule(&self, id: NodeId, action: &SchedAction) -> DriverResult<()> {
        let body = serde_json::to_value(action).map_err(|e| DriverError::Decode(e.to_string()))?;
        self.post_vm("schedule", id, "sched_actions", body).await
    }
}
