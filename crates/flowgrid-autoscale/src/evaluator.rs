//! Elasticity evaluator.
//!
//! Decides a role's cardinality change for one tick. The only state it
//! touches is the evaluation history of the role's policies.

use tracing::{debug, warn};

use flowgrid_state::{Role, RoleMetrics, RoleState};

/// Recommendation for one role on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Evaluation {
    /// Signed cardinality change, 0 for none.
    pub delta: i64,
    /// Seconds of cooldown: remaining while cooling down, or the cooldown
    /// that applies after this scale when `delta` is nonzero.
    pub cooldown: u64,
}

/// Evaluate `role`'s policies against `metrics` at `now`.
pub fn evaluate(
    role: &mut Role,
    metrics: Option<&RoleMetrics>,
    now: u64,
    default_cooldown: u64,
) -> Evaluation {
    match role.state {
        RoleState::Running => {}
        RoleState::Cooldown => {
            return Evaluation {
                delta: 0,
                cooldown: role.cooldown_remaining(now),
            };
        }
        _ => return Evaluation::default(),
    }

    let remaining = role.cooldown_remaining(now);
    if remaining > 0 {
        return Evaluation {
            delta: 0,
            cooldown: remaining,
        };
    }

    let mut triggered = None;
    for (idx, policy) in role.elasticity_policies.iter_mut().enumerate() {
        let expression = match policy.parse_expression() {
            Ok(expr) => expr,
            Err(e) => {
                warn!(role = %role.name, error = %e, "skipping malformed elasticity policy");
                continue;
            }
        };
        if !policy.due(now) {
            continue;
        }

        let observed = metrics.and_then(|m| m.value(&expression.attribute));
        let holds = observed.is_some_and(|v| expression.holds(v));
        policy.record(holds, now);
        debug!(
            role = %role.name,
            expression = %expression,
            ?observed,
            holds,
            window = policy.true_evals.len(),
            "policy sampled"
        );

        if triggered.is_none() && policy.triggered() {
            triggered = Some(idx);
        }
    }

    let Some(idx) = triggered else {
        return Evaluation::default();
    };
    let policy = &role.elasticity_policies[idx];
    let current = i64::from(role.cardinality);
    let min = i64::from(role.min_cardinality());
    let max = role.max_vms.map(i64::from).unwrap_or(i64::from(u32::MAX));
    let target = current
        .saturating_add(policy.kind.delta(role.cardinality))
        .clamp(min, max.max(min));

    Evaluation {
        delta: target - current,
        cooldown: policy.cooldown.or(role.cooldown).unwrap_or(default_cooldown),
    }
}
