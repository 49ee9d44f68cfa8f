//! Cluster state value types
//!
//! Every process keeps one [`ClusterState`]: a map of per-node records plus
//! the sorted index sequence derived from it. The local process is the only
//! writer of its own record; every other record is a read-only replica kept
//! fresh by last-writer-wins merges of gossiped state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique node identifier, doubles as the leader-election tiebreaker
pub type NodeId = u16;

/// Partitionable work unit from the shared catalog
pub type WorkerId = String;

/// Leader value meaning "no opinion yet"
pub const NO_LEADER: NodeId = 0;

/// Per-node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Process came up, transport not joined yet
    Starting,
    /// Initial seed join in progress
    Joining,
    /// Rest state: joined, not reconfiguring, not running workers
    Idle,
    /// Waiting for a peer's state to arrive
    Assembling,
    /// Between reconfiguration steps
    Configuring,
    /// Waiting for the leader fixpoint
    Electing,
    /// Computing the local worker slice
    Assigning,
    /// Assigned workers are running
    Working,
    /// Workers being stopped
    Stopping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Joining => "joining",
            Phase::Idle => "idle",
            Phase::Assembling => "assembling",
            Phase::Configuring => "configuring",
            Phase::Electing => "electing",
            Phase::Assigning => "assigning",
            Phase::Working => "working",
            Phase::Stopping => "stopping",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node's replicated record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Transport-level node name
    pub name: String,
    /// Current lifecycle state
    pub state: Phase,
    /// This node's leader opinion ([`NO_LEADER`] until elected)
    pub leader: NodeId,
    /// Assigned worker slice
    #[serde(default)]
    pub workers: Vec<WorkerId>,
    /// Whether the assigned workers are actually running
    #[serde(default)]
    pub working: bool,
    /// Instant of the last mutation on the owning node
    pub timestamp: DateTime<Utc>,
}

impl NodeState {
    pub fn new(name: impl Into<String>, state: Phase, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state,
            leader: NO_LEADER,
            workers: Vec::new(),
            working: false,
            timestamp,
        }
    }
}

/// The full replicated view held by one process
#[derive(Debug, Clone)]
pub struct ClusterState {
    /// All known node records, keyed by node id
    pub nodes: HashMap<NodeId, NodeState>,

    /// Ascending-sorted key set of `nodes`; a node's position here is its rank
    pub indexes: Vec<NodeId>,

    /// Local-only view of which catalog workers this process is running
    pub working: HashMap<WorkerId, bool>,
}

impl ClusterState {
    /// Create the state for a fresh process with only the local record
    pub fn new(
        local_id: NodeId,
        local_name: impl Into<String>,
        phase: Phase,
        catalog: &[WorkerId],
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local_id, NodeState::new(local_name, phase, timestamp));

        Self {
            nodes,
            indexes: vec![local_id],
            working: catalog.iter().map(|w| (w.clone(), false)).collect(),
        }
    }

    /// Rebuild `indexes` from the current key set
    pub fn rebuild_indexes(&mut self) {
        let mut indexes: Vec<NodeId> = self.nodes.keys().copied().collect();
        indexes.sort_unstable();
        self.indexes = indexes;
    }

    /// Rank of a node id in the sorted index sequence
    pub fn rank(&self, id: NodeId) -> Option<usize> {
        self.indexes.iter().position(|&n| n == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> NodeState {
        NodeState::new(name, Phase::Idle, Utc::now())
    }

    #[test]
    fn test_rebuild_indexes_sorted() {
        let mut state = ClusterState::new(7, "n7", Phase::Starting, &[], Utc::now());
        state.nodes.insert(3, entry("n3"));
        state.nodes.insert(12, entry("n12"));
        state.rebuild_indexes();

        assert_eq!(state.indexes, vec![3, 7, 12]);
        assert_eq!(state.rank(3), Some(0));
        assert_eq!(state.rank(7), Some(1));
        assert_eq!(state.rank(12), Some(2));
        assert_eq!(state.rank(99), None);
    }

    #[test]
    fn test_phase_wire_names() {
        let json = serde_json::to_string(&Phase::Assigning).unwrap();
        assert_eq!(json, "\"assigning\"");
        let back: Phase = serde_json::from_str("\"configuring\"").unwrap();
        assert_eq!(back, Phase::Configuring);
    }

    #[test]
    fn test_node_state_timestamp_rfc3339() {
        let node = entry("node-a");
        let value = serde_json::to_value(&node).unwrap();
        // chrono serializes DateTime<Utc> as an RFC 3339 string
        let ts = value.get("timestamp").and_then(|v| v.as_str()).unwrap();
        assert!(ts.ends_with('Z') || ts.contains("+00:00"));
    }
}
