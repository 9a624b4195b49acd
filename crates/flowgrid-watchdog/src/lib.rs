//! flowgrid-watchdog: turns VM state events into role health intents.
//!
//! A [`Watchdog`] subscribes to `EVENT VM <id>` topics on an [`EventBus`]
//! for every node of a watched service, classifies each event and sends the
//! resulting error, done or running intent through an `IntentSender`.

pub mod bus;
pub mod codec;
pub mod error;
pub mod index;
pub mod watchdog;

pub use bus::{BusMessage, EventBus, EventSubscriber, MemoryBus, ZmqBus};
pub use codec::{VmEvent, decode, topic_for, topic_matches};
pub use error::{BusError, BusResult, DecodeError, WatchdogError, WatchdogResult};
pub use index::MonitorIndex;
pub use watchdog::{DEFAULT_RECV_TIMEOUT, Watchdog};
