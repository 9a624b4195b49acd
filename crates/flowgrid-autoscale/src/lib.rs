//! flowgrid-autoscale: elasticity policies turned into scale intents.
//!
//! # Evaluation
//!
//! ```text
//! for each RUNNING role, once per tick:
//!     for each policy whose period has elapsed:
//!         sample = metrics[attribute] <op> threshold   (missing attribute = false)
//!         push sample into a window of period_number samples
//!     first policy whose window is full of true samples:
//!         delta = kind.delta(cardinality), clamped into [min_vms, max_vms]
//!         cooldown = policy.cooldown | role.cooldown | default
//! ```
//!
//! A COOLDOWN role yields delta 0 and its remaining cooldown. The control
//! loop acts on at most one role per service per tick and skips services
//! with a role already in transition.

pub mod evaluator;
pub mod scaler;

pub use evaluator::{Evaluation, evaluate};
pub use scaler::{AutoScaler, ScaleDecision};
