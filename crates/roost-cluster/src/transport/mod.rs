//! Gossip transport contract
//!
//! The coordination layer does not implement membership discovery itself; it
//! plugs into a SWIM-style gossip transport through the traits below. The
//! transport owns failure detection and message passing; the coordination
//! layer hands it two hooks at creation time: a [`Delegate`] for state
//! exchange and user messages, and an [`EventDelegate`] for join/leave
//! notifications. [`memory::MemoryHub`] is an in-process implementation of
//! this contract used by the tests and the console runner.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A peer as announced by the transport
#[derive(Debug, Clone)]
pub struct Member {
    /// Transport-level node name
    pub name: String,
    /// Reachable endpoint, `host:port`
    pub addr: String,
    /// Attached metadata bytes
    pub meta: Vec<u8>,
}

/// Network identity handed to the transport at creation
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub node_name: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub advertise_addr: String,
    pub advertise_port: u16,
    /// Interval between full state exchanges with a random peer
    pub push_pull_interval: Duration,
}

impl TransportOptions {
    /// The endpoint peers use to reach this node
    pub fn advertised(&self) -> String {
        let addr = if self.advertise_addr.is_empty() {
            &self.bind_addr
        } else {
            &self.advertise_addr
        };
        let port = if self.advertise_port == 0 {
            self.bind_port
        } else {
            self.advertise_port
        };
        format!("{addr}:{port}")
    }
}

/// State-exchange and user-message hook, invoked by the transport.
///
/// Implementations must return quickly: the transport's receive loop is
/// single-threaded and every callback runs on it.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata bytes attached to every announcement, at most `limit` bytes
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user broadcast arrived
    fn notify_msg(&self, buf: &[u8]);

    /// Pending user broadcasts to piggyback on the next gossip round
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Serialized local state for a push/pull exchange; empty at join time
    fn local_state(&self, is_join: bool) -> Vec<u8>;

    /// Merge a peer's push/pull payload; undecodable bytes fail the callback
    fn merge_remote_state(&self, buf: &[u8], is_join: bool) -> Result<()>;
}

/// Membership-change hook, invoked by the transport.
///
/// Calls may come from multiple tasks but never concurrently, so per-source
/// ordering can be relied on.
pub trait EventDelegate: Send + Sync + 'static {
    fn notify_join(&self, member: &Member);
    fn notify_leave(&self, member: &Member);
    fn notify_update(&self, member: &Member);
}

/// The two hooks bundled for transport creation
#[derive(Clone)]
pub struct GossipHooks {
    pub delegate: Arc<dyn Delegate>,
    pub events: Arc<dyn EventDelegate>,
}

/// A running gossip transport instance
#[async_trait]
pub trait Gossip: Send + Sync + 'static {
    /// Contact seed peers and merge into their cluster; returns the number
    /// of seeds successfully contacted.
    async fn join(&self, peers: &[String]) -> Result<usize>;

    /// Current member count, the local node included
    fn num_members(&self) -> usize;

    /// All current members
    fn members(&self) -> Vec<Member>;

    /// The local node as announced to peers
    fn local_member(&self) -> Member;

    /// Leave the cluster and stop all transport tasks
    async fn shutdown(&self) -> Result<()>;
}
