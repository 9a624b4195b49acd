//! VM event topic and payload format.
//!
//! Topic: `EVENT VM <node-id>`. Payload: `<node-id>/<vm-state>/<lcm-state>`.
//! Publishers that fold the triple into the topic (`EVENT VM 7/ACTIVE/RUNNING`)
//! are understood too; the payload is then ignored.

use flowgrid_state::{LcmState, NodeId, VmState};

use crate::error::DecodeError;

const TOPIC_PREFIX: &str = "EVENT VM";

/// Topic a node's events are published on.
pub fn topic_for(node_id: NodeId) -> String {
    format!("{TOPIC_PREFIX} {node_id}")
}

/// Whether `topic` falls under `subscription`: the same string, or the
/// subscription followed by a `/`-separated state triple.
pub fn topic_matches(subscription: &str, topic: &str) -> bool {
    match topic.strip_prefix(subscription) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A decoded VM state notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEvent {
    pub node_id: NodeId,
    pub state: VmState,
    pub lcm_state: LcmState,
}

fn parse_triple(body: &str) -> Result<VmEvent, DecodeError> {
    let body = body.trim();
    let mut parts = body.split('/');
    let (Some(id), Some(state), Some(lcm), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(DecodeError::Body(body.to_string()));
    };
    let node_id = id
        .parse::<NodeId>()
        .map_err(|_| DecodeError::Body(body.to_string()))?;
    if state.is_empty() || lcm.is_empty() {
        return Err(DecodeError::Body(body.to_string()));
    }
    Ok(VmEvent {
        node_id,
        state: VmState::from(state),
        lcm_state: LcmState::from(lcm),
    })
}

/// Decode one `(topic, payload)` message.
pub fn decode(topic: &str, payload: &str) -> Result<VmEvent, DecodeError> {
    let mut tokens = topic.split_whitespace();
    let (Some("EVENT"), Some("VM"), Some(key), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(DecodeError::Topic(topic.to_string()));
    };

    if key.contains('/') {
        return parse_triple(key);
    }

    let topic_id = key
        .parse::<NodeId>()
        .map_err(|_| DecodeError::Topic(topic.to_string()))?;
    let event = parse_triple(payload)?;
    if event.node_id != topic_id {
        return Err(DecodeError::IdMismatch {
            topic: topic_id,
            payload: event.node_id,
        });
    }
    Ok(event)
}
