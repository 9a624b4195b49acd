//! The life cycle manager boundary.
//!
//! The LCM owns every persisted mutation of services and roles; flowgrid
//! only asks. Both calls are acknowledgements, not completions.

use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use serde_json::json;
use tracing::debug;

use flowgrid_core::http::{Endpoint, send_json};
use flowgrid_state::{HealthEvent, NodeId, ServiceId};

use crate::error::{LcmError, LcmResult};
use crate::session::Session;

/// Header carrying [`Session::header_value`].
pub const SESSION_HEADER: &str = "x-flowgrid-session";

#[async_trait]
pub trait LifeCycleManager: Send + Sync {
    /// Ask for `role` to be resized to `cardinality`.
    async fn scale_action(
        &self,
        session: &Session,
        service_id: ServiceId,
        role: &str,
        cardinality: u32,
        force: bool,
    ) -> LcmResult<()>;

    /// Report a node health event. `queue` selects the LCM work queue the
    /// action is serialized on; flowgrid always passes the service id.
    async fn trigger_action(
        &self,
        kind: HealthEvent,
        queue: ServiceId,
        session: &Session,
        service_id: ServiceId,
        role: &str,
        node_id: NodeId,
    ) -> LcmResult<()>;
}

/// LCM reached over its JSON REST interface.
pub struct HttpLcm {
    endpoint: Endpoint,
    timeout: Duration,
}

impl HttpLcm {
    pub fn new(endpoint: &str, timeout: Duration) -> LcmResult<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            timeout,
        })
    }

    async fn post(&self, session: &Session, path: &str, body: serde_json::Value) -> LcmResult<()> {
        let header = session.header_value();
        let resp = send_json(
            &self.endpoint,
            Method::POST,
            path,
            &[(SESSION_HEADER, header.as_str())],
            Some(&body),
            self.timeout,
        )
        .await?;
        if !resp.status.is_success() {
            return Err(LcmError::Rejected {
                status: resp.status.as_u16(),
                body: String::from_utf8_lossy(&resp.body).into_owned(),
            });
        }
        debug!(%path, status = %resp.status, "lcm acknowledged");
        Ok(())
    }
}

#[async_trait]
impl LifeCycleManager for HttpLcm {
    async fn scale_action(
        &self,
        session: &Session,
        service_id: ServiceId,
        role: &str,
        cardinality: u32,
        force: bool,
    ) -> LcmResult<()> {
        let path = format!("/v1/services/{service_id}/roles/{role}/scale");
        self.post(
            session,
            &path,
            json!({ "cardinality": cardinality, "force": force }),
        )
        .await
    }

    async fn trigger_action(
        &self,
        kind: HealthEvent,
        queue: ServiceId,
        session: &Session,
        service_id: ServiceId,
        role: &str,
        node_id: NodeId,
    ) -> LcmResult<()> {
        let path = format!("/v1/services/{queue}/actions");
        self.post(
            session,
            &path,
            json!({
                "kind": kind,
                "service_id": service_id,
                "role": role,
                "node_id": node_id,
            }),
        )
        .await
    }
}
