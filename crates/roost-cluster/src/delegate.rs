//! State-exchange hook handed to the gossip transport
//!
//! Push/pull carries the local record only; the rest of the replica is
//! rebuilt on the receiving side by last-writer-wins merges. At join time
//! the exchange is suppressed entirely: the joining side has no durable
//! state worth merging yet, and pushing it would race the `joining → idle`
//! transition.

use crate::broadcast::TransmitQueue;
use crate::error::Result;
use crate::protocol::{self, Envelope, SelectLeaderMessage, SELECT_LEADER_METHOD};
use crate::state::NodeId;
use crate::state_manager::StateManager;
use crate::transport::Delegate;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ClusterDelegate {
    node_id: NodeId,
    state: Arc<StateManager>,
    queue: Arc<TransmitQueue>,
}

impl ClusterDelegate {
    pub fn new(node_id: NodeId, state: Arc<StateManager>, queue: Arc<TransmitQueue>) -> Self {
        Self {
            node_id,
            state,
            queue,
        }
    }
}

impl Delegate for ClusterDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        match protocol::encode_node_meta(self.node_id) {
            Ok(buf) if buf.len() <= limit => buf,
            Ok(buf) => {
                error!(len = buf.len(), limit, "node metadata exceeds limit");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "node metadata encoding failed");
                Vec::new()
            }
        }
    }

    fn notify_msg(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }

        let envelope: Envelope = match serde_json::from_slice(buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable user broadcast");
                return;
            }
        };

        match envelope.method.as_str() {
            SELECT_LEADER_METHOD => match serde_json::from_slice::<SelectLeaderMessage>(buf) {
                Ok(msg) => {
                    // Advisory only: the binding leader opinion comes from
                    // the election fixpoint over merged state.
                    info!(
                        node = %self.state.local_node_name(),
                        leader = msg.args.leader,
                        "leader announcement received"
                    );
                }
                Err(e) => warn!(error = %e, "malformed select_leader broadcast"),
            },
            method => debug!(method, "ignoring unknown broadcast method"),
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.queue.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, is_join: bool) -> Vec<u8> {
        if is_join {
            debug!(node = %self.state.local_node_name(), "suppressing state push at join");
            return Vec::new();
        }

        match protocol::encode_state(&self.state.local_state()) {
            Ok(buf) => buf,
            Err(e) => {
                error!(error = %e, "state encoding failed");
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], is_join: bool) -> Result<()> {
        if is_join || buf.is_empty() {
            return Ok(());
        }

        let payload = protocol::decode_state(buf)?;
        self.state.import_state(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RETRANSMIT_MULT;
    use crate::state::Phase;

    fn delegate(id: NodeId) -> (ClusterDelegate, Arc<StateManager>) {
        let state = Arc::new(StateManager::new(id, format!("node-{id}"), vec!["w0".into()]));
        let queue = Arc::new(TransmitQueue::new(RETRANSMIT_MULT));
        (ClusterDelegate::new(id, state.clone(), queue), state)
    }

    #[test]
    fn test_node_meta_encodes_id() {
        let (d, _) = delegate(7);
        let meta = protocol::decode_node_meta(&d.node_meta(512)).unwrap();
        assert_eq!(meta.node_id, 7);
    }

    #[test]
    fn test_node_meta_respects_limit() {
        let (d, _) = delegate(7);
        assert!(d.node_meta(2).is_empty());
    }

    #[test]
    fn test_local_state_empty_at_join() {
        let (d, _) = delegate(1);
        assert!(d.local_state(true).is_empty());
        assert!(!d.local_state(false).is_empty());
    }

    #[test]
    fn test_merge_ignores_join_and_empty() {
        let (d1, _) = delegate(1);
        let (d2, sm2) = delegate(2);

        let buf = d1.local_state(false);
        d2.merge_remote_state(&buf, true).unwrap();
        assert!(!sm2.has_node(1));

        d2.merge_remote_state(&[], false).unwrap();
        assert!(!sm2.has_node(1));
    }

    #[test]
    fn test_merge_imports_state() {
        let (d1, sm1) = delegate(1);
        let (d2, sm2) = delegate(2);
        sm1.set_phase(Phase::Idle);

        d2.merge_remote_state(&d1.local_state(false), false).unwrap();
        assert!(sm2.has_node(1));
        assert_eq!(sm2.snapshot().nodes[&1].state, Phase::Idle);
    }

    #[test]
    fn test_merge_rejects_garbage() {
        let (d, _) = delegate(1);
        let err = d.merge_remote_state(b"][ not json", false).unwrap_err();
        assert!(matches!(err, crate::error::ClusterError::Serialization(_)));
    }
}
