//! Publish/subscribe event bus.
//!
//! The watchdog only needs a subscriber: subscribe and unsubscribe by topic,
//! then receive `(topic, payload)` messages with a timeout. Two transports:
//!
//! - [`ZmqBus`]: a ZeroMQ SUB socket connected to the VM event publisher.
//!   Each event is a two-frame message, topic then payload.
//! - [`MemoryBus`]: an in-process broadcast channel.
//!
//! ZeroMQ subscriptions match by prefix, so both also filter on the client
//! side with [`topic_matches`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::codec::topic_matches;
use crate::error::{BusError, BusResult};

/// Bound on establishing the SUB connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

#[async_trait]
pub trait EventSubscriber: Send {
    async fn subscribe(&mut self, topic: &str) -> BusResult<()>;

    async fn unsubscribe(&mut self, topic: &str) -> BusResult<()>;

    /// Next matching message, or `Ok(None)` when `timeout` elapses first.
    /// Cancel-safe: dropping the future loses no message.
    async fn recv(&mut self, timeout: Duration) -> BusResult<Option<BusMessage>>;
}

/// Source of subscribers, one per watched service.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscriber(&self) -> BusResult<Box<dyn EventSubscriber>>;
}

fn any_match(topics: &HashSet<String>, topic: &str) -> bool {
    topics.iter().any(|sub| topic_matches(sub, topic))
}

// ── In-process bus ──────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every live subscriber. Returns how many received it.
    pub fn publish(&self, topic: &str, payload: &str) -> usize {
        self.tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn subscriber(&self) -> BusResult<Box<dyn EventSubscriber>> {
        Ok(Box::new(MemorySubscriber {
            rx: self.tx.subscribe(),
            topics: HashSet::new(),
        }))
    }
}

pub struct MemorySubscriber {
    rx: broadcast::Receiver<BusMessage>,
    topics: HashSet<String>,
}

impl MemorySubscriber {
    async fn next_message(&mut self) -> BusResult<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if any_match(&self.topics, &msg.topic) => return Ok(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}

#[async_trait]
impl EventSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, topic: &str) -> BusResult<()> {
        self.topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> BusResult<()> {
        self.topics.remove(topic);
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> BusResult<Option<BusMessage>> {
        match tokio::time::timeout(timeout, self.next_message()).await {
            Ok(msg) => msg.map(Some),
            Err(_) => Ok(None),
        }
    }
}

// ── ZeroMQ bus ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ZmqBus {
    endpoint: String,
    connect_timeout: Duration,
}

impl ZmqBus {
    /// `endpoint` is `tcp://host:port` or `ipc://path`.
    pub fn new(endpoint: &str) -> BusResult<Self> {
        let valid = ["tcp://", "ipc://"]
            .iter()
            .any(|scheme| endpoint.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()));
        if !valid {
            return Err(BusError::Endpoint(endpoint.to_string()));
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EventBus for ZmqBus {
    async fn subscriber(&self) -> BusResult<Box<dyn EventSubscriber>> {
        let mut socket = SubSocket::new();
        let connect_error = |reason: String| BusError::Connect {
            endpoint: self.endpoint.clone(),
            reason,
        };
        match tokio::time::timeout(self.connect_timeout, socket.connect(&self.endpoint)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(connect_error(e.to_string())),
            Err(_) => {
                return Err(connect_error(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        }
        debug!(endpoint = %self.endpoint, "event bus connected");
        Ok(Box::new(ZmqSubscriber {
            socket,
            topics: HashSet::new(),
        }))
    }
}

pub struct ZmqSubscriber {
    socket: SubSocket,
    topics: HashSet<String>,
}

/// Split a two-frame message into topic and payload.
fn frames(msg: ZmqMessage) -> Option<BusMessage> {
    if msg.len() != 2 {
        return None;
    }
    let frame = |i: usize| {
        msg.get(i)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .map(str::to_string)
    };
    Some(BusMessage {
        topic: frame(0)?,
        payload: frame(1)?,
    })
}

impl ZmqSubscriber {
    async fn next_message(&mut self) -> BusResult<BusMessage> {
        loop {
            let msg = self
                .socket
                .recv()
                .await
                .map_err(|e| BusError::Transport(e.to_string()))?;
            match frames(msg) {
                Some(msg) if any_match(&self.topics, &msg.topic) => return Ok(msg),
                Some(_) => {}
                None => warn!("dropping event that is not a utf-8 topic/payload pair"),
            }
        }
    }
}

#[async_trait]
impl EventSubscriber for ZmqSubscriber {
    async fn subscribe(&mut self, topic: &str) -> BusResult<()> {
        self.socket
            .subscribe(topic)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        self.topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> BusResult<()> {
        self.topics.remove(topic);
        self.socket
            .unsubscribe(topic)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn recv(&mut self, timeout: Duration) -> BusResult<Option<BusMessage>> {
        match tokio::time::timeout(timeout, self.next_message()).await {
            Ok(msg) => msg.map(Some),
            Err(_) => Ok(None),
        }
    }
}
