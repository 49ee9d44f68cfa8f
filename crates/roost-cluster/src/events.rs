//! Membership-change hook handed to the gossip transport
//!
//! Translates transport callbacks into typed channel sends for the
//! orchestrator. The channels are unbounded so the transport's callback
//! thread is never blocked; bursts are collapsed downstream by the
//! orchestrator's supersede rule.

use crate::protocol;
use crate::state::NodeId;
use crate::transport::{EventDelegate, Member};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ClusterEvents {
    debug: bool,
    local_name: String,
    join_tx: mpsc::UnboundedSender<NodeId>,
    leave_tx: mpsc::UnboundedSender<NodeId>,
}

impl ClusterEvents {
    pub fn new(
        debug: bool,
        local_name: impl Into<String>,
        join_tx: mpsc::UnboundedSender<NodeId>,
        leave_tx: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        Self {
            debug,
            local_name: local_name.into(),
            join_tx,
            leave_tx,
        }
    }

    fn decode_id(&self, member: &Member) -> Option<NodeId> {
        match protocol::decode_node_meta(&member.meta) {
            Ok(meta) => Some(meta.node_id),
            Err(e) => {
                warn!(
                    node = %self.local_name,
                    peer = %member.name,
                    error = %e,
                    "peer metadata undecodable, ignoring event"
                );
                None
            }
        }
    }
}

impl EventDelegate for ClusterEvents {
    fn notify_join(&self, member: &Member) {
        if member.name == self.local_name {
            return;
        }

        let Some(id) = self.decode_id(member) else {
            return;
        };
        if self.debug {
            info!(node = %self.local_name, peer = id, "member joined");
        } else {
            debug!(node = %self.local_name, peer = id, "member joined");
        }
        if self.join_tx.send(id).is_err() {
            warn!(node = %self.local_name, peer = id, "join event dropped, orchestrator gone");
        }
    }

    fn notify_leave(&self, member: &Member) {
        let Some(id) = self.decode_id(member) else {
            return;
        };
        if self.debug {
            info!(node = %self.local_name, peer = id, "member left");
        } else {
            debug!(node = %self.local_name, peer = id, "member left");
        }
        if self.leave_tx.send(id).is_err() {
            warn!(node = %self.local_name, peer = id, "leave event dropped, orchestrator gone");
        }
    }

    fn notify_update(&self, _member: &Member) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, id: NodeId) -> Member {
        Member {
            name: name.to_string(),
            addr: format!("127.0.0.1:{id}"),
            meta: protocol::encode_node_meta(id).unwrap(),
        }
    }

    fn events() -> (
        ClusterEvents,
        mpsc::UnboundedReceiver<NodeId>,
        mpsc::UnboundedReceiver<NodeId>,
    ) {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (leave_tx, leave_rx) = mpsc::unbounded_channel();
        (
            ClusterEvents::new(false, "000001-local", join_tx, leave_tx),
            join_rx,
            leave_rx,
        )
    }

    #[test]
    fn test_join_forwards_node_id() {
        let (ev, mut join_rx, _leave_rx) = events();
        ev.notify_join(&member("000002-peer", 2));
        assert_eq!(join_rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_self_join_filtered() {
        let (ev, mut join_rx, _leave_rx) = events();
        ev.notify_join(&member("000001-local", 1));
        assert!(join_rx.try_recv().is_err());
    }

    #[test]
    fn test_leave_forwards_node_id() {
        let (ev, _join_rx, mut leave_rx) = events();
        ev.notify_leave(&member("000003-peer", 3));
        assert_eq!(leave_rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_garbage_meta_dropped() {
        let (ev, mut join_rx, _leave_rx) = events();
        let mut bad = member("000004-peer", 4);
        bad.meta = b"not json".to_vec();
        ev.notify_join(&bad);
        assert!(join_rx.try_recv().is_err());
    }
}
