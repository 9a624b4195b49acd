//! Auto-scaler control loop.
//!
//! Every tick reads the service pool, evaluates the roles of each quiet
//! RUNNING service and sends a scale intent for the first role that wants
//! to change. The loop never waits for a scale to complete; the next tick
//! sees its progress through the role states.

use std::time::Duration;

use tracing::{debug, info, warn};

use flowgrid_intent::{IntentSender, Session};
use flowgrid_state::{ServiceId, StateStore, epoch_secs};

use crate::evaluator::evaluate;

/// A scale intent issued on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDecision {
    pub service_id: ServiceId,
    pub role: String,
    pub from: u32,
    pub to: u32,
    /// Cooldown in seconds that applies once the scale completes.
    pub cooldown: u64,
}

pub struct AutoScaler {
    state: StateStore,
    intents: IntentSender,
    session: Session,
    default_cooldown: u64,
}

impl AutoScaler {
    pub fn new(
        state: StateStore,
        intents: IntentSender,
        session: Session,
        default_cooldown: Duration,
    ) -> Self {
        Self {
            state,
            intents,
            session,
            default_cooldown: default_cooldown.as_secs(),
        }
    }

    /// Run one evaluation pass over the pool at the current time.
    pub async fn tick(&self) -> anyhow::Result<Vec<ScaleDecision>> {
        self.tick_at(epoch_secs()).await
    }

    /// Run one evaluation pass as if the time were `now`.
    pub async fn tick_at(&self, now: u64) -> anyhow::Result<Vec<ScaleDecision>> {
        let pool = self.state.list_services()?;
        let mut decisions = Vec::new();

        for snapshot in pool {
            let service_id = snapshot.id;
            if !snapshot.can_scale() {
                debug!(service_id, state = %snapshot.state, "service not eligible for scaling");
                continue;
            }
            // Re-read the service right before evaluating it.
            let Some(mut service) = self.state.get_service(service_id)? else {
                continue;
            };
            if !service.can_scale() {
                continue;
            }

            for role in service.roles.iter_mut() {
                if role.elasticity_policies.is_empty() {
                    continue;
                }
                let metrics = self.state.latest_role_metrics(service_id, &role.name)?;
                let eval = evaluate(role, metrics.as_ref(), now, self.default_cooldown);

                match self.state.record_policy_evaluations(
                    service_id,
                    &role.name,
                    &role.elasticity_policies,
                ) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(service_id, role = %role.name, "role changed state during evaluation");
                        continue;
                    }
                    Err(e) => {
                        warn!(service_id, role = %role.name, error = %e, "failed to record policy evaluations");
                    }
                }

                if eval.delta == 0 {
                    continue;
                }

                let from = role.cardinality;
                let to = u32::try_from(i64::from(from) + eval.delta).unwrap_or(from);
                info!(
                    service_id,
                    role = %role.name,
                    from,
                    to,
                    cooldown = eval.cooldown,
                    "requesting scale"
                );
                match self
                    .intents
                    .scale(&self.session, service_id, &role.name, to, false)
                    .await
                {
                    Ok(()) => decisions.push(ScaleDecision {
                        service_id,
                        role: role.name.clone(),
                        from,
                        to,
                        cooldown: eval.cooldown,
                    }),
                    Err(e) => {
                        warn!(service_id, role = %role.name, error = %e, "scale intent not sent")
                    }
                }
                // One role per service per tick.
                break;
            }
        }

        Ok(decisions)
    }

    /// Run the auto-scaler loop until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "auto-scaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.tick().await {
                        Ok(decisions) if !decisions.is_empty() => {
                            debug!(count = decisions.len(), "auto-scaler tick issued scale intents");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "auto-scaler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("auto-scaler shutting down");
                    break;
                }
            }
        }
    }
}
