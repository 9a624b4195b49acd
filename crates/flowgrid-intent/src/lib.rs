//! flowgrid-intent: the boundary to the life cycle manager (LCM).
//!
//! Producers (auto-scaler, watchdog) build [`Intent`]s and push them through
//! an [`IntentSender`]. The [`IntentDispatcher`] is the single consumer: it
//! forwards intents to a [`LifeCycleManager`] while keeping at most one call
//! in flight per role.

pub mod dispatcher;
pub mod error;
pub mod intent;
pub mod lcm;
pub mod session;

pub use dispatcher::IntentDispatcher;
pub use error::{DispatchError, LcmError, LcmResult};
pub use intent::{Intent, IntentSender, RoleKey, intent_channel};
pub use lcm::{HttpLcm, LifeCycleManager, SESSION_HEADER};
pub use session::Session;
