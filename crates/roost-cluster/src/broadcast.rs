//! Named user broadcasts and the bounded retransmit queue
//!
//! Broadcasts are keyed by name: queueing a new message under a name already
//! pending invalidates the older copy, so repeated announcements collapse to
//! the newest one. Each pending message piggybacks on gossip rounds until it
//! has been handed out `mult * ceil(log10(n + 1))` times, with `n` supplied
//! by a member-count callback installed once the transport is up.

use crate::error::Result;
use crate::protocol::{SelectLeaderMessage, SELECT_LEADER_METHOD};
use crate::state::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Default retransmit multiplier
pub const RETRANSMIT_MULT: u32 = 3;

type NumNodesFn = Box<dyn Fn() -> usize + Send + 'static>;

struct NamedBroadcast {
    name: String,
    msg: Vec<u8>,
    transmits: u32,
    notify: Option<oneshot::Sender<()>>,
}

impl NamedBroadcast {
    /// Fire the completion notification, if any
    fn finished(mut self) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(());
        }
    }
}

struct QueueInner {
    queue: Vec<NamedBroadcast>,
    num_nodes: Option<NumNodesFn>,
}

/// Bounded retransmit queue for named broadcasts
pub struct TransmitQueue {
    retransmit_mult: u32,
    inner: Mutex<QueueInner>,
}

impl TransmitQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            retransmit_mult,
            inner: Mutex::new(QueueInner {
                queue: Vec::new(),
                num_nodes: None,
            }),
        }
    }

    /// Install the member-count source used to scale the retransmit limit
    pub fn set_num_nodes(&self, f: impl Fn() -> usize + Send + 'static) {
        self.inner.lock().num_nodes = Some(Box::new(f));
    }

    /// Queue a message under a name, invalidating any pending message with
    /// the same name.
    pub fn queue_broadcast(&self, name: impl Into<String>, msg: Vec<u8>) {
        self.queue_with_notify(name, msg, None);
    }

    /// Like [`Self::queue_broadcast`], with a completion notification fired
    /// when the message leaves the queue (fully transmitted or invalidated).
    pub fn queue_with_notify(
        &self,
        name: impl Into<String>,
        msg: Vec<u8>,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let name = name.into();
        let mut inner = self.inner.lock();

        let mut i = 0;
        while i < inner.queue.len() {
            if inner.queue[i].name == name {
                let old = inner.queue.remove(i);
                debug!(name = %old.name, "broadcast invalidated by newer message");
                old.finished();
            } else {
                i += 1;
            }
        }

        inner.queue.push(NamedBroadcast {
            name,
            msg,
            transmits: 0,
            notify,
        });
    }

    /// Hand out pending messages fitting the byte budget, bumping each
    /// message's transmit counter and retiring exhausted ones.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();

        let n = inner.num_nodes.as_ref().map(|f| f()).unwrap_or(1).max(1);
        let max_transmits = self.retransmit_limit(n);

        let mut used = 0usize;
        let mut out = Vec::new();
        for item in inner.queue.iter_mut() {
            let cost = overhead + item.msg.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            item.transmits += 1;
            out.push(item.msg.clone());
        }

        let mut retired = Vec::new();
        let mut i = 0;
        while i < inner.queue.len() {
            if inner.queue[i].transmits >= max_transmits {
                retired.push(inner.queue.remove(i));
            } else {
                i += 1;
            }
        }
        drop(inner);

        for item in retired {
            debug!(name = %item.name, "broadcast fully transmitted");
            item.finished();
        }

        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retransmit_limit(&self, num_nodes: usize) -> u32 {
        let scale = ((num_nodes + 1) as f64).log10().ceil() as u32;
        self.retransmit_mult * scale.max(1)
    }
}

/// Producer-side API over the retransmit queue
#[derive(Clone)]
pub struct Messenger {
    queue: Arc<TransmitQueue>,
}

impl Messenger {
    pub fn new(queue: Arc<TransmitQueue>) -> Self {
        Self { queue }
    }

    /// Queue an arbitrary named broadcast
    pub fn broadcast(&self, name: impl Into<String>, msg: Vec<u8>) {
        self.queue.queue_broadcast(name, msg);
    }

    /// Announce a leader choice; repeated announcements collapse on the name
    pub fn select_leader(&self, leader: NodeId) -> Result<()> {
        let msg = serde_json::to_vec(&SelectLeaderMessage::new(leader))?;
        self.queue.queue_broadcast(SELECT_LEADER_METHOD, msg);
        Ok(())
    }
}
