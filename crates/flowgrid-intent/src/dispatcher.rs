//! Central consumer of intents.
//!
//! The auto-scaler and the watchdog both produce intents against the same
//! roles. The dispatcher keeps at most one LCM call in flight per role:
//!
//! - a health intent for a busy role waits in a FIFO behind the call;
//! - a scale intent for a busy role is rejected with
//!   [`DispatchError::RoleBusy`]. The auto-scaler re-evaluates next tick.
//!
//! LCM calls run in spawned tasks and report back over a completion channel,
//! so a slow LCM never blocks intake for other roles.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::intent::{Intent, IntentSender, RoleKey};
use crate::lcm::LifeCycleManager;

/// Outcome of one LCM call, reported to the dispatcher loop.
#[derive(Debug)]
struct Completion {
    key: RoleKey,
    ok: bool,
}

pub struct IntentDispatcher {
    lcm: Arc<dyn LifeCycleManager>,
    intents: mpsc::Receiver<Intent>,
    /// Busy roles and the health intents queued behind them.
    in_flight: BTreeMap<RoleKey, VecDeque<Intent>>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
}

impl IntentDispatcher {
    /// Create a dispatcher and the sender producers use to reach it.
    pub fn new(lcm: Arc<dyn LifeCycleManager>, queue_depth: usize) -> (Self, IntentSender) {
        let (tx, intents) = mpsc::channel(queue_depth.max(1));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            lcm,
            intents,
            in_flight: BTreeMap::new(),
            done_tx,
            done_rx,
        };
        (dispatcher, IntentSender::new(tx))
    }

    /// Roles with an LCM call in flight.
    pub fn busy_roles(&self) -> Vec<RoleKey> {
        self.in_flight.keys().cloned().collect()
    }

    /// Intents waiting behind `key`'s in-flight call.
    pub fn queued(&self, key: &RoleKey) -> usize {
        self.in_flight.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Accept one intent: start it, queue it, or reject it.
    pub fn submit(&mut self, intent: Intent) -> Result<(), DispatchError> {
        let key = intent.role_key();
        match self.in_flight.get_mut(&key) {
            Some(_) if intent.is_scale() => Err(DispatchError::RoleBusy {
                service_id: key.service_id,
                role: key.role,
            }),
            Some(queue) => {
                debug!(service_id = key.service_id, role = %key.role, kind = intent.kind(), "intent queued behind in-flight call");
                queue.push_back(intent);
                Ok(())
            }
            None => {
                self.in_flight.insert(key, VecDeque::new());
                self.launch(intent);
                Ok(())
            }
        }
    }

    /// Wait for the next LCM call to finish, then start whatever was queued
    /// behind it. Returns the role that finished.
    pub async fn complete_next(&mut self) -> Option<RoleKey> {
        let completion = self.done_rx.recv().await?;
        let key = completion.key.clone();
        self.finish(completion);
        Some(key)
    }

    fn launch(&self, intent: Intent) {
        let lcm = Arc::clone(&self.lcm);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let key = intent.role_key();
            let label = intent.kind();
            let result = match &intent {
                Intent::Scale {
                    session,
                    service_id,
                    role,
                    cardinality,
                    force,
                } => {
                    lcm.scale_action(session, *service_id, role, *cardinality, *force)
                        .await
                }
                Intent::Trigger {
                    kind,
                    session,
                    service_id,
                    role,
                    node_id,
                } => {
                    lcm.trigger_action(*kind, *service_id, session, *service_id, role, *node_id)
                        .await
                }
            };
            let ok = match result {
                Ok(()) => {
                    info!(service_id = key.service_id, role = %key.role, kind = label, "intent acknowledged by lcm");
                    true
                }
                Err(e) => {
                    warn!(service_id = key.service_id, role = %key.role, kind = label, error = %e, "lcm call failed");
                    false
                }
            };
            let _ = done.send(Completion { key, ok });
        });
    }

    fn finish(&mut self, completion: Completion) {
        let Completion { key, ok } = completion;
        let next = self
            .in_flight
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(intent) => {
                debug!(service_id = key.service_id, role = %key.role, ok, "starting queued intent");
                self.launch(intent);
            }
            None => {
                self.in_flight.remove(&key);
            }
        }
    }

    /// Consume intents until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("intent dispatcher started");
        loop {
            tokio::select! {
                Some(intent) = self.intents.recv() => {
                    if let Err(e) = self.submit(intent) {
                        warn!(error = %e, "intent rejected");
                    }
                }
                Some(completion) = self.done_rx.recv() => {
                    self.finish(completion);
                }
                _ = shutdown.changed() => {
                    info!(in_flight = self.in_flight.len(), "intent dispatcher shutting down");
                    break;
                }
            }
        }
    }
}
