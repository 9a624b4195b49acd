//! Intents emitted by the auto-scaler and the watchdog.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use flowgrid_state::{HealthEvent, NodeId, ServiceId};

use crate::error::DispatchError;
use crate::session::Session;

/// A request for the LCM to change a role.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Resize a role.
    Scale {
        session: Session,
        service_id: ServiceId,
        role: String,
        cardinality: u32,
        force: bool,
    },
    /// Report a node health change.
    Trigger {
        kind: HealthEvent,
        session: Session,
        service_id: ServiceId,
        role: String,
        node_id: NodeId,
    },
}

/// Identifies the role an intent targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleKey {
    pub service_id: ServiceId,
    pub role: String,
}

impl Intent {
    pub fn role_key(&self) -> RoleKey {
        let (service_id, role) = match self {
            Intent::Scale {
                service_id, role, ..
            }
            | Intent::Trigger {
                service_id, role, ..
            } => (*service_id, role.clone()),
        };
        RoleKey { service_id, role }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Scale { .. } => "scale",
            Intent::Trigger { kind, .. } => kind.as_str(),
        }
    }

    pub fn is_scale(&self) -> bool {
        matches!(self, Intent::Scale { .. })
    }
}

/// Producer handle onto the dispatcher's queue.
#[derive(Clone)]
pub struct IntentSender {
    tx: mpsc::Sender<Intent>,
}

impl IntentSender {
    pub(crate) fn new(tx: mpsc::Sender<Intent>) -> Self {
        Self { tx }
    }

    /// Queue an intent. Waits only when the queue is full.
    pub async fn send(&self, intent: Intent) -> Result<(), DispatchError> {
        self.tx.send(intent).await.map_err(|_| DispatchError::Closed)
    }

    pub async fn scale(
        &self,
        session: &Session,
        service_id: ServiceId,
        role: &str,
        cardinality: u32,
        force: bool,
    ) -> Result<(), DispatchError> {
        self.send(Intent::Scale {
            session: session.clone(),
            service_id,
            role: role.to_string(),
            cardinality,
            force,
        })
        .await
    }

    pub async fn trigger(
        &self,
        kind: HealthEvent,
        session: &Session,
        service_id: ServiceId,
        role: &str,
        node_id: NodeId,
    ) -> Result<(), DispatchError> {
        self.send(Intent::Trigger {
            kind,
            session: session.clone(),
            service_id,
            role: role.to_string(),
            node_id,
        })
        .await
    }
}

/// A sender/receiver pair for tests and for wiring a custom consumer.
pub fn intent_channel(depth: usize) -> (IntentSender, mpsc::Receiver<Intent>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (IntentSender::new(tx), rx)
}
