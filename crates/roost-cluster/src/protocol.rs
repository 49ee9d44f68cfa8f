//! Wire formats for gossip payloads
//!
//! Everything on the wire is JSON: the per-node metadata attached to every
//! announcement, the push/pull state payload (stringified node ids mapped to
//! node records), and the user-broadcast envelope.

use crate::error::Result;
use crate::state::{NodeId, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Broadcast method announcing a leader choice
pub const SELECT_LEADER_METHOD: &str = "select_leader";

/// Push/pull state payload: node id to node record
pub type StatePayload = HashMap<NodeId, NodeState>;

/// Metadata attached to every node announcement, binds node id to node name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
}

pub fn encode_node_meta(node_id: NodeId) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&NodeMeta { node_id })?)
}

pub fn decode_node_meta(buf: &[u8]) -> Result<NodeMeta> {
    Ok(serde_json::from_slice(buf)?)
}

pub fn encode_state(payload: &StatePayload) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

pub fn decode_state(buf: &[u8]) -> Result<StatePayload> {
    Ok(serde_json::from_slice(buf)?)
}

/// User-broadcast envelope, decoded first to dispatch on `method`
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub method: String,
}

/// `select_leader` broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectLeaderMessage {
    pub method: String,
    pub args: SelectLeaderArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectLeaderArgs {
    pub leader: NodeId,
}

impl SelectLeaderMessage {
    pub fn new(leader: NodeId) -> Self {
        Self {
            method: SELECT_LEADER_METHOD.to_string(),
            args: SelectLeaderArgs { leader },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;
    use chrono::Utc;

    #[test]
    fn test_node_meta_field_name() {
        let buf = encode_node_meta(9).unwrap();
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), r#"{"NodeID":9}"#);
        assert_eq!(decode_node_meta(&buf).unwrap().node_id, 9);
    }

    #[test]
    fn test_state_payload_keys_are_strings() {
        let mut payload = StatePayload::new();
        payload.insert(3, NodeState::new("n3", Phase::Idle, Utc::now()));

        let buf = encode_state(&payload).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(value.get("3").is_some());

        let back = decode_state(&buf).unwrap();
        assert_eq!(back.get(&3).unwrap().name, "n3");
    }

    #[test]
    fn test_select_leader_envelope() {
        let buf = serde_json::to_vec(&SelectLeaderMessage::new(5)).unwrap();

        let envelope: Envelope = serde_json::from_slice(&buf).unwrap();
        assert_eq!(envelope.method, SELECT_LEADER_METHOD);

        let msg: SelectLeaderMessage = serde_json::from_slice(&buf).unwrap();
        assert_eq!(msg.args.leader, 5);
    }

    #[test]
    fn test_decode_state_rejects_garbage() {
        assert!(decode_state(b"not json").is_err());
    }
}
