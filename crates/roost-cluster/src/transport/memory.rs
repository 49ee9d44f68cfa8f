//! In-process loopback transport
//!
//! [`MemoryHub`] wires any number of in-process nodes into a mesh that
//! honors the gossip contract: join/leave notifications (including the
//! self-announcement every transport delivers), a periodic bidirectional
//! push/pull state exchange with a random peer, and a gossip pump that
//! drains queued user broadcasts to every peer. It backs the integration
//! tests and the console runner; a production SWIM transport plugs into the
//! same traits.

use crate::error::{ClusterError, Result};
use crate::transport::{Gossip, GossipHooks, Member, TransportOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Metadata byte budget per announcement
const META_LIMIT: usize = 512;

/// Interval between broadcast pump rounds
const GOSSIP_INTERVAL: Duration = Duration::from_millis(200);

/// Per-message framing overhead charged against the broadcast budget
const BROADCAST_OVERHEAD: usize = 2;

/// Broadcast byte budget per gossip round
const BROADCAST_LIMIT: usize = 1400;

struct Slot {
    member: Member,
    hooks: GossipHooks,
    /// Mesh id: nodes see each other only within the same group until a
    /// join merges their groups.
    group: u64,
    alive: bool,
}

struct HubInner {
    slots: HashMap<String, Slot>,
    next_group: u64,
}

/// Registry of in-process transports forming one loopback network
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                slots: HashMap::new(),
                next_group: 0,
            })),
        }
    }

    /// Register a node and start its gossip tasks.
    ///
    /// The node is announced to its own event delegate, exactly as a real
    /// transport announces the local node.
    pub fn create(&self, opts: TransportOptions, hooks: GossipHooks) -> Result<Arc<MemoryGossip>> {
        let addr = opts.advertised();
        let meta = hooks.delegate.node_meta(META_LIMIT);
        let member = Member {
            name: opts.node_name.clone(),
            addr: addr.clone(),
            meta,
        };

        {
            let mut inner = self.inner.lock();
            if inner.slots.get(&addr).is_some_and(|s| s.alive) {
                return Err(ClusterError::InvalidConfig(format!(
                    "address '{addr}' already in use"
                )));
            }
            let group = inner.next_group;
            inner.next_group += 1;
            inner.slots.insert(
                addr.clone(),
                Slot {
                    member: member.clone(),
                    hooks: hooks.clone(),
                    group,
                    alive: true,
                },
            );
        }

        hooks.events.notify_join(&member);

        let (shutdown_tx, _) = broadcast::channel(1);
        let gossip = Arc::new(MemoryGossip {
            hub: self.inner.clone(),
            addr: addr.clone(),
            shutdown_tx: shutdown_tx.clone(),
        });

        spawn_push_pull(
            self.inner.clone(),
            addr.clone(),
            opts.push_pull_interval,
            shutdown_tx.subscribe(),
        );
        spawn_gossip_pump(self.inner.clone(), addr, shutdown_tx.subscribe());

        Ok(gossip)
    }
}

/// One node's handle on the loopback mesh
pub struct MemoryGossip {
    hub: Arc<Mutex<HubInner>>,
    addr: String,
    shutdown_tx: broadcast::Sender<()>,
}

#[async_trait]
impl Gossip for MemoryGossip {
    async fn join(&self, peers: &[String]) -> Result<usize> {
        let mut contacted = 0usize;

        for peer in peers {
            let announcements = {
                let mut inner = self.hub.lock();

                let Some(peer_slot) = inner.slots.get(peer) else {
                    warn!(peer = %peer, "seed not reachable");
                    continue;
                };
                if !peer_slot.alive {
                    warn!(peer = %peer, "seed not alive");
                    continue;
                }
                let target_group = peer_slot.group;
                contacted += 1;

                let my_group = inner
                    .slots
                    .get(&self.addr)
                    .filter(|s| s.alive)
                    .map(|s| s.group)
                    .ok_or_else(|| ClusterError::Internal("transport is shut down".into()))?;
                if my_group == target_group {
                    continue;
                }

                let joiners: Vec<(GossipHooks, Member)> = inner
                    .slots
                    .values()
                    .filter(|s| s.alive && s.group == my_group)
                    .map(|s| (s.hooks.clone(), s.member.clone()))
                    .collect();
                let hosts: Vec<(GossipHooks, Member)> = inner
                    .slots
                    .values()
                    .filter(|s| s.alive && s.group == target_group)
                    .map(|s| (s.hooks.clone(), s.member.clone()))
                    .collect();

                for slot in inner.slots.values_mut() {
                    if slot.alive && slot.group == my_group {
                        slot.group = target_group;
                    }
                }

                (joiners, hosts)
            };

            // Announce across the former mesh boundary, outside the lock.
            let (joiners, hosts) = announcements;
            for (joiner_hooks, joiner) in &joiners {
                for (host_hooks, host) in &hosts {
                    joiner_hooks.events.notify_join(host);
                    host_hooks.events.notify_join(joiner);
                }
            }
        }

        if contacted == 0 {
            return Err(ClusterError::JoinFailed(
                "could not contact any seed node".into(),
            ));
        }
        Ok(contacted)
    }

    fn num_members(&self) -> usize {
        let inner = self.hub.lock();
        let Some(group) = inner
            .slots
            .get(&self.addr)
            .filter(|s| s.alive)
            .map(|s| s.group)
        else {
            return 0;
        };
        inner
            .slots
            .values()
            .filter(|s| s.alive && s.group == group)
            .count()
    }

    fn members(&self) -> Vec<Member> {
        let inner = self.hub.lock();
        let Some(group) = inner
            .slots
            .get(&self.addr)
            .filter(|s| s.alive)
            .map(|s| s.group)
        else {
            return Vec::new();
        };
        inner
            .slots
            .values()
            .filter(|s| s.alive && s.group == group)
            .map(|s| s.member.clone())
            .collect()
    }

    fn local_member(&self) -> Member {
        self.hub.lock().slots[&self.addr].member.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        let (my_member, peers) = {
            let mut inner = self.hub.lock();
            let Some(slot) = inner.slots.get_mut(&self.addr) else {
                return Ok(());
            };
            if !slot.alive {
                return Ok(());
            }
            slot.alive = false;
            let group = slot.group;
            let my_member = slot.member.clone();

            let peers: Vec<GossipHooks> = inner
                .slots
                .values()
                .filter(|s| s.alive && s.group == group)
                .map(|s| s.hooks.clone())
                .collect();
            (my_member, peers)
        };

        for hooks in peers {
            hooks.events.notify_leave(&my_member);
        }
        debug!(addr = %self.addr, "transport shut down");
        Ok(())
    }
}

/// Periodic bidirectional full-state exchange with one random peer
fn spawn_push_pull(
    hub: Arc<Mutex<HubInner>>,
    addr: String,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let pair = {
                let inner = hub.lock();
                let Some(me) = inner.slots.get(&addr).filter(|s| s.alive) else {
                    return;
                };
                let group = me.group;
                let mine = me.hooks.delegate.clone();

                let candidates: Vec<_> = inner
                    .slots
                    .values()
                    .filter(|s| s.alive && s.group == group && s.member.addr != addr)
                    .map(|s| s.hooks.delegate.clone())
                    .collect();
                candidates
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .map(|peer| (mine, peer))
            };

            let Some((mine, peer)) = pair else { continue };

            let buf = mine.local_state(false);
            if !buf.is_empty() {
                if let Err(e) = peer.merge_remote_state(&buf, false) {
                    warn!(error = %e, "push/pull merge failed on peer");
                }
            }
            let buf = peer.local_state(false);
            if !buf.is_empty() {
                if let Err(e) = mine.merge_remote_state(&buf, false) {
                    warn!(error = %e, "push/pull merge failed locally");
                }
            }
        }
    });
}

/// Drain queued broadcasts and deliver them to every peer in the mesh
fn spawn_gossip_pump(
    hub: Arc<Mutex<HubInner>>,
    addr: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(GOSSIP_INTERVAL) => {}
            }

            let (mine, peers) = {
                let inner = hub.lock();
                let Some(me) = inner.slots.get(&addr).filter(|s| s.alive) else {
                    return;
                };
                let group = me.group;
                let mine = me.hooks.delegate.clone();
                let peers: Vec<_> = inner
                    .slots
                    .values()
                    .filter(|s| s.alive && s.group == group && s.member.addr != addr)
                    .map(|s| s.hooks.delegate.clone())
                    .collect();
                (mine, peers)
            };

            if peers.is_empty() {
                continue;
            }

            let msgs = mine.get_broadcasts(BROADCAST_OVERHEAD, BROADCAST_LIMIT);
            for msg in &msgs {
                for peer in &peers {
                    peer.notify_msg(msg);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Delegate, EventDelegate};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDelegate {
        state: Mutex<Vec<u8>>,
        merged: Mutex<Vec<Vec<u8>>>,
        msgs: Mutex<Vec<Vec<u8>>>,
    }

    impl Delegate for RecordingDelegate {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            b"{}".to_vec()
        }
        fn notify_msg(&self, buf: &[u8]) {
            self.msgs.lock().push(buf.to_vec());
        }
        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn local_state(&self, _is_join: bool) -> Vec<u8> {
            self.state.lock().clone()
        }
        fn merge_remote_state(&self, buf: &[u8], _is_join: bool) -> Result<()> {
            self.merged.lock().push(buf.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        joins: Mutex<Vec<String>>,
        leaves: Mutex<Vec<String>>,
    }

    impl EventDelegate for RecordingEvents {
        fn notify_join(&self, member: &Member) {
            self.joins.lock().push(member.name.clone());
        }
        fn notify_leave(&self, member: &Member) {
            self.leaves.lock().push(member.name.clone());
        }
        fn notify_update(&self, _member: &Member) {}
    }

    fn options(name: &str, port: u16) -> TransportOptions {
        TransportOptions {
            node_name: name.to_string(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: port,
            advertise_addr: String::new(),
            advertise_port: 0,
            push_pull_interval: Duration::from_millis(100),
        }
    }

    fn node(
        hub: &MemoryHub,
        name: &str,
        port: u16,
    ) -> (
        Arc<MemoryGossip>,
        Arc<RecordingDelegate>,
        Arc<RecordingEvents>,
    ) {
        let delegate = Arc::new(RecordingDelegate::default());
        let events = Arc::new(RecordingEvents::default());
        let gossip = hub
            .create(
                options(name, port),
                GossipHooks {
                    delegate: delegate.clone(),
                    events: events.clone(),
                },
            )
            .unwrap();
        (gossip, delegate, events)
    }

    #[tokio::test]
    async fn test_join_announces_both_ways() {
        let hub = MemoryHub::new();
        let (_g1, _d1, e1) = node(&hub, "one", 1);
        let (g2, _d2, e2) = node(&hub, "two", 2);

        // Self-announcements happen at creation.
        assert_eq!(*e1.joins.lock(), vec!["one".to_string()]);
        assert_eq!(*e2.joins.lock(), vec!["two".to_string()]);

        let contacted = g2.join(&["127.0.0.1:1".to_string()]).await.unwrap();
        assert_eq!(contacted, 1);

        assert!(e1.joins.lock().contains(&"two".to_string()));
        assert!(e2.joins.lock().contains(&"one".to_string()));
        assert_eq!(g2.num_members(), 2);
        assert_eq!(g2.local_member().name, "two");

        let mut names: Vec<String> = g2.members().into_iter().map(|m| m.name).collect();
        names.sort();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_join_unknown_seed_fails() {
        let hub = MemoryHub::new();
        let (g1, _d1, _e1) = node(&hub, "one", 1);
        let err = g1.join(&["127.0.0.1:9".to_string()]).await.unwrap_err();
        assert!(matches!(err, ClusterError::JoinFailed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_announces_leave() {
        let hub = MemoryHub::new();
        let (g1, _d1, e1) = node(&hub, "one", 1);
        let (g2, _d2, _e2) = node(&hub, "two", 2);
        g2.join(&["127.0.0.1:1".to_string()]).await.unwrap();

        g2.shutdown().await.unwrap();
        assert_eq!(*e1.leaves.lock(), vec!["two".to_string()]);
        assert_eq!(g1.num_members(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_pull_exchanges_state() {
        let hub = MemoryHub::new();
        let (_g1, d1, _e1) = node(&hub, "one", 1);
        let (g2, d2, _e2) = node(&hub, "two", 2);
        g2.join(&["127.0.0.1:1".to_string()]).await.unwrap();

        *d1.state.lock() = b"from-one".to_vec();
        *d2.state.lock() = b"from-two".to_vec();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(d1.merged.lock().iter().any(|b| b == b"from-two"));
        assert!(d2.merged.lock().iter().any(|b| b == b"from-one"));
    }
}
