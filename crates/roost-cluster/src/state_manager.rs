//! Atomic owner of the replicated cluster state
//!
//! All reads and writes of [`ClusterState`] and the per-node FSM go through
//! this type. Compound operations (merge, election check, worker assignment,
//! index rebuild) run entirely under the write lock so the state invariants
//! hold transactionally: the index sequence always mirrors the sorted key
//! set, the local record always exists and tracks the FSM, and every local
//! mutation advances the record's timestamp strictly forward.
//!
//! The local record is the only one written here; remote records change only
//! through [`StateManager::import_state`], which applies last-writer-wins on
//! the record timestamps and never touches the local entry. With a single
//! writer per key the merge is commutative, associative and idempotent.

use crate::error::{ClusterError, Result};
use crate::fsm::{Event, Fsm};
use crate::protocol::StatePayload;
use crate::state::{ClusterState, NodeId, Phase, WorkerId, NO_LEADER};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

struct Inner {
    fsm: Fsm,
    state: ClusterState,
    last_stamp: DateTime<Utc>,
}

/// Owner of the local replica; see the module docs for the locking rules
pub struct StateManager {
    local_id: NodeId,
    local_name: String,
    catalog: Vec<WorkerId>,
    inner: RwLock<Inner>,
}

impl StateManager {
    pub fn new(local_id: NodeId, local_name: impl Into<String>, catalog: Vec<WorkerId>) -> Self {
        let local_name = local_name.into();
        let fsm = Fsm::new();
        let now = Utc::now();
        let state = ClusterState::new(local_id, local_name.clone(), fsm.current(), &catalog, now);

        Self {
            local_id,
            local_name,
            catalog,
            inner: RwLock::new(Inner {
                fsm,
                state,
                last_stamp: now,
            }),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_node_name(&self) -> &str {
        &self.local_name
    }

    pub fn current_phase(&self) -> Phase {
        self.inner.read().fsm.current()
    }

    pub fn size(&self) -> usize {
        self.inner.read().state.nodes.len()
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.inner.read().state.nodes.contains_key(&id)
    }

    /// The local record's current leader opinion
    pub fn leader(&self) -> NodeId {
        self.inner.read().state.nodes[&self.local_id].leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == self.local_id
    }

    /// Copy of the full local replica, for display and tests
    pub fn snapshot(&self) -> ClusterState {
        self.inner.read().state.clone()
    }

    /// Fire an FSM event and mirror the new state into the local record
    pub fn trigger(&self, event: Event) -> Result<()> {
        let mut inner = self.inner.write();
        let transition = inner.fsm.trigger(event)?;

        info!(
            node = %self.local_name,
            event = %transition.event,
            src = %transition.from,
            dst = %transition.to,
            "state transition"
        );

        self.sync_local(&mut inner);
        self.verify(&inner)
    }

    /// Unconditional state set, used only during bootstrap
    pub fn set_phase(&self, phase: Phase) {
        let mut inner = self.inner.write();
        inner.fsm.set(phase);
        self.sync_local(&mut inner);
    }

    /// Drop a departed node's record and rebuild the index sequence.
    /// Returns false when the node was not known.
    pub fn remove_node(&self, id: NodeId) -> Result<bool> {
        if id == self.local_id {
            warn!(node = %self.local_name, "refusing to remove the local record");
            return Ok(false);
        }

        let mut inner = self.inner.write();
        if inner.state.nodes.remove(&id).is_none() {
            return Ok(false);
        }
        inner.state.rebuild_indexes();

        // A leader opinion pointing at the departed node reverts to
        // "no opinion" until the next election runs.
        let local = self.local_mut(&mut inner);
        if local.leader == id {
            local.leader = NO_LEADER;
            self.touch(&mut inner);
        }

        self.verify(&inner)?;
        Ok(true)
    }

    /// Merge remote records, last writer wins.
    ///
    /// New nodes are inserted, known nodes are overwritten only by a strictly
    /// newer timestamp, and the local record is never replaced.
    pub fn import_state(&self, remote: StatePayload) -> Result<()> {
        let mut inner = self.inner.write();
        let mut inserted = 0usize;
        let mut updated = 0usize;
        let mut dropped = 0usize;

        for (id, record) in remote {
            if id == self.local_id {
                continue;
            }

            match inner.state.nodes.get(&id) {
                None => {
                    inner.state.nodes.insert(id, record);
                    inserted += 1;
                }
                Some(known) if record.timestamp > known.timestamp => {
                    inner.state.nodes.insert(id, record);
                    updated += 1;
                }
                Some(_) => dropped += 1,
            }
        }

        if inserted > 0 {
            inner.state.rebuild_indexes();
        }

        if inserted + updated > 0 {
            debug!(
                node = %self.local_name,
                inserted,
                updated,
                dropped,
                "merged remote state"
            );
        }

        self.verify(&inner)
    }

    /// The local record alone, keyed by node id, ready for transmission
    pub fn local_state(&self) -> StatePayload {
        let inner = self.inner.read();
        let mut payload = StatePayload::new();
        payload.insert(self.local_id, inner.state.nodes[&self.local_id].clone());
        payload
    }

    /// Adopt `min(node ids)` as the local leader opinion and report whether
    /// every known record agrees. This detects a stable fixpoint; it is not
    /// a vote.
    pub fn elect_leader(&self) -> bool {
        let mut inner = self.inner.write();

        let Some(min) = inner.state.nodes.keys().copied().min() else {
            return true;
        };

        if inner.state.nodes[&self.local_id].leader != min {
            info!(node = %self.local_name, leader = min, "adopting leader");
            self.local_mut(&mut inner).leader = min;
            self.touch(&mut inner);
        }

        inner.state.nodes.values().all(|n| n.leader == min)
    }

    /// Recompute the local worker slice by modular striping: with rank `r`
    /// among `n` nodes the local node takes every catalog entry whose index
    /// is congruent to `r` mod `n`.
    pub fn assign_workers(&self) -> Result<()> {
        let mut inner = self.inner.write();

        let n = inner.state.nodes.len();
        let rank = inner.state.rank(self.local_id).ok_or_else(|| {
            ClusterError::FatalInvariant(format!(
                "local node {} missing from indexes",
                self.local_id
            ))
        })?;

        let workers: Vec<WorkerId> = self
            .catalog
            .iter()
            .enumerate()
            .filter(|(i, _)| i % n == rank)
            .map(|(_, w)| w.clone())
            .collect();

        info!(
            node = %self.local_name,
            rank,
            nodes = n,
            workers = ?workers,
            "workers assigned"
        );

        self.local_mut(&mut inner).workers = workers;
        self.touch(&mut inner);
        self.verify(&inner)
    }

    /// Mark the assigned workers running and flip the local working flag
    pub fn start_workers(&self) -> Result<()> {
        let mut inner = self.inner.write();

        for running in inner.state.working.values_mut() {
            *running = false;
        }

        let assigned = inner.state.nodes[&self.local_id].workers.clone();
        for worker in &assigned {
            inner.state.working.insert(worker.clone(), true);
        }

        let working = !assigned.is_empty();
        if working {
            info!(node = %self.local_name, workers = ?assigned, "workers started");
        }

        self.local_mut(&mut inner).working = working;
        self.touch(&mut inner);
        self.verify(&inner)
    }

    /// Stop every running worker; no-op when none are running
    pub fn stop_workers(&self) -> Result<()> {
        let mut inner = self.inner.write();

        if !inner.state.nodes[&self.local_id].working {
            return Ok(());
        }

        for running in inner.state.working.values_mut() {
            *running = false;
        }

        info!(node = %self.local_name, "workers stopped");

        self.local_mut(&mut inner).working = false;
        self.touch(&mut inner);
        self.verify(&inner)
    }

    fn local_mut<'a>(&self, inner: &'a mut Inner) -> &'a mut crate::state::NodeState {
        inner
            .state
            .nodes
            .get_mut(&self.local_id)
            .expect("local record always present")
    }

    /// Mirror the FSM state into the local record and stamp it
    fn sync_local(&self, inner: &mut Inner) {
        let phase = inner.fsm.current();
        self.local_mut(inner).state = phase;
        self.touch(inner);
    }

    /// Advance the local record's timestamp strictly forward even when the
    /// UTC clock has not moved between mutations.
    fn touch(&self, inner: &mut Inner) {
        let mut now = Utc::now();
        if now <= inner.last_stamp {
            now = inner.last_stamp + ChronoDuration::microseconds(1);
        }
        inner.last_stamp = now;
        self.local_mut(inner).timestamp = now;
    }

    fn verify(&self, inner: &Inner) -> Result<()> {
        let state = &inner.state;

        let mut keys: Vec<NodeId> = state.nodes.keys().copied().collect();
        keys.sort_unstable();
        if state.indexes != keys {
            return Err(ClusterError::FatalInvariant(format!(
                "indexes {:?} diverged from node keys {:?}",
                state.indexes, keys
            )));
        }

        let Some(local) = state.nodes.get(&self.local_id) else {
            return Err(ClusterError::FatalInvariant(
                "local record missing".to_string(),
            ));
        };
        if local.name != self.local_name {
            return Err(ClusterError::FatalInvariant(format!(
                "local record renamed to '{}'",
                local.name
            )));
        }
        if local.state != inner.fsm.current() {
            return Err(ClusterError::FatalInvariant(format!(
                "local record state '{}' diverged from fsm '{}'",
                local.state,
                inner.fsm.current()
            )));
        }
        if local.leader != NO_LEADER && !state.nodes.contains_key(&local.leader) {
            return Err(ClusterError::FatalInvariant(format!(
                "local leader opinion {} not a known node",
                local.leader
            )));
        }
        if local.working {
            if local.workers.is_empty() {
                return Err(ClusterError::FatalInvariant(
                    "working with an empty worker slice".to_string(),
                ));
            }
            for worker in &local.workers {
                if !state.working.get(worker).copied().unwrap_or(false) {
                    return Err(ClusterError::FatalInvariant(format!(
                        "assigned worker '{worker}' not running"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeState;

    fn catalog(n: usize) -> Vec<WorkerId> {
        (0..n).map(|i| format!("w{i}")).collect()
    }

    fn manager(id: NodeId) -> StateManager {
        StateManager::new(id, format!("node-{id}"), catalog(7))
    }

    fn remote(name: &str, leader: NodeId, timestamp: DateTime<Utc>) -> NodeState {
        let mut record = NodeState::new(name, Phase::Idle, timestamp);
        record.leader = leader;
        record
    }

    fn payload(entries: Vec<(NodeId, NodeState)>) -> StatePayload {
        entries.into_iter().collect()
    }

    #[test]
    fn test_trigger_updates_local_record() {
        let sm = manager(1);
        sm.set_phase(Phase::Idle);
        sm.trigger(Event::Assemble).unwrap();

        let snap = sm.snapshot();
        assert_eq!(snap.nodes[&1].state, Phase::Assembling);
        assert_eq!(sm.current_phase(), Phase::Assembling);
    }

    #[test]
    fn test_trigger_illegal_leaves_record_unchanged() {
        let sm = manager(1);
        let before = sm.snapshot().nodes[&1].clone();

        let err = sm.trigger(Event::Elect).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidTransition { .. }));
        assert_eq!(sm.snapshot().nodes[&1], before);
        assert_eq!(sm.current_phase(), Phase::Starting);
    }

    #[test]
    fn test_timestamps_strictly_monotone() {
        let sm = manager(1);
        sm.set_phase(Phase::Idle);

        let mut stamps = Vec::new();
        for _ in 0..50 {
            sm.trigger(Event::Assemble).unwrap();
            stamps.push(sm.snapshot().nodes[&1].timestamp);
            sm.trigger(Event::Finish).unwrap();
            stamps.push(sm.snapshot().nodes[&1].timestamp);
        }

        for pair in stamps.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_import_inserts_and_rebuilds_indexes() {
        let sm = manager(2);
        let now = Utc::now();

        sm.import_state(payload(vec![
            (1, remote("node-1", 0, now)),
            (3, remote("node-3", 0, now)),
        ]))
        .unwrap();

        let snap = sm.snapshot();
        assert_eq!(snap.indexes, vec![1, 2, 3]);
        assert_eq!(snap.rank(2), Some(1));
    }

    #[test]
    fn test_import_drops_stale_update() {
        let sm = manager(1);
        let now = Utc::now();

        sm.import_state(payload(vec![(2, remote("node-2", 2, now))]))
            .unwrap();
        // one second older than the known record
        sm.import_state(payload(vec![(
            2,
            remote("node-2", 9, now - ChronoDuration::seconds(1)),
        )]))
        .unwrap();

        let snap = sm.snapshot();
        assert_eq!(snap.nodes[&2].leader, 2);
    }

    #[test]
    fn test_import_applies_newer_update() {
        let sm = manager(1);
        let now = Utc::now();

        sm.import_state(payload(vec![(2, remote("node-2", 0, now))]))
            .unwrap();
        sm.import_state(payload(vec![(
            2,
            remote("node-2", 1, now + ChronoDuration::seconds(1)),
        )]))
        .unwrap();

        assert_eq!(sm.snapshot().nodes[&2].leader, 1);
    }

    #[test]
    fn test_import_never_overwrites_local_record() {
        let sm = manager(1);
        let before = sm.snapshot().nodes[&1].clone();

        sm.import_state(payload(vec![(
            1,
            remote("impostor", 9, Utc::now() + ChronoDuration::hours(1)),
        )]))
        .unwrap();

        assert_eq!(sm.snapshot().nodes[&1], before);
    }

    #[test]
    fn test_merge_order_independent() {
        // Same multiset of writes in different orders converges identically.
        let now = Utc::now();
        let writes = [
            (2, remote("node-2", 0, now)),
            (3, remote("node-3", 0, now + ChronoDuration::seconds(1))),
            (2, remote("node-2", 1, now + ChronoDuration::seconds(2))),
            (3, remote("node-3", 1, now - ChronoDuration::seconds(1))),
        ];

        let a = manager(1);
        for w in writes.iter() {
            a.import_state(payload(vec![w.clone()])).unwrap();
        }

        let b = manager(1);
        for w in writes.iter().rev() {
            b.import_state(payload(vec![w.clone()])).unwrap();
        }

        // Idempotence: replaying everything changes nothing.
        b.import_state(writes.iter().cloned().collect()).unwrap();

        let (sa, sb) = (a.snapshot(), b.snapshot());
        assert_eq!(sa.nodes[&2], sb.nodes[&2]);
        assert_eq!(sa.nodes[&3], sb.nodes[&3]);
        assert_eq!(sa.nodes[&2].leader, 1);
        assert_eq!(sa.nodes[&3].leader, 0);
    }

    #[test]
    fn test_remove_node_rebuilds_indexes_and_clears_leader() {
        let sm = manager(2);
        let now = Utc::now();
        sm.import_state(payload(vec![
            (1, remote("node-1", 1, now)),
            (3, remote("node-3", 1, now)),
        ]))
        .unwrap();
        assert!(sm.elect_leader());
        assert_eq!(sm.leader(), 1);

        assert!(sm.remove_node(1).unwrap());
        let snap = sm.snapshot();
        assert_eq!(snap.indexes, vec![2, 3]);
        assert!(!snap.nodes.contains_key(&1));
        // opinion pointing at the departed leader reverts to no-opinion
        assert_eq!(sm.leader(), NO_LEADER);

        assert!(!sm.remove_node(1).unwrap());
        assert!(!sm.remove_node(2).unwrap());
    }

    #[test]
    fn test_elect_leader_fixpoint() {
        let sm = manager(2);
        let now = Utc::now();

        // Remote records do not agree yet.
        sm.import_state(payload(vec![
            (1, remote("node-1", 0, now)),
            (3, remote("node-3", 0, now)),
        ]))
        .unwrap();
        assert!(!sm.elect_leader());
        assert_eq!(sm.leader(), 1);
        assert!(!sm.is_leader());

        // Agreement arrives with newer stamps.
        sm.import_state(payload(vec![
            (1, remote("node-1", 1, now + ChronoDuration::seconds(1))),
            (3, remote("node-3", 1, now + ChronoDuration::seconds(1))),
        ]))
        .unwrap();
        assert!(sm.elect_leader());
    }

    #[test]
    fn test_elect_leader_single_node() {
        let sm = manager(5);
        assert!(sm.elect_leader());
        assert!(sm.is_leader());
        assert_eq!(sm.leader(), 5);
    }

    #[test]
    fn test_assignment_partitions_catalog() {
        let now = Utc::now();
        let managers = [manager(1), manager(2), manager(3)];

        for sm in &managers {
            let others: Vec<_> = [1u16, 2, 3]
                .iter()
                .filter(|&&id| id != sm.local_node_id())
                .map(|&id| (id, remote(&format!("node-{id}"), 0, now)))
                .collect();
            sm.import_state(others.into_iter().collect()).unwrap();
            sm.assign_workers().unwrap();
        }

        let slices: Vec<Vec<WorkerId>> = managers
            .iter()
            .map(|sm| sm.snapshot().nodes[&sm.local_node_id()].workers.clone())
            .collect();

        assert_eq!(slices[0], vec!["w0", "w3", "w6"]);
        assert_eq!(slices[1], vec!["w1", "w4"]);
        assert_eq!(slices[2], vec!["w2", "w5"]);

        // Disjoint cover of the whole catalog.
        let mut all: Vec<WorkerId> = slices.concat();
        all.sort();
        assert_eq!(all, catalog(7));
    }

    #[test]
    fn test_start_and_stop_workers() {
        let sm = manager(1);
        sm.assign_workers().unwrap();
        sm.start_workers().unwrap();

        let snap = sm.snapshot();
        assert!(snap.nodes[&1].working);
        assert!(snap.nodes[&1].workers.iter().all(|w| snap.working[w]));

        sm.stop_workers().unwrap();
        let snap = sm.snapshot();
        assert!(!snap.nodes[&1].working);
        assert!(snap.working.values().all(|running| !running));

        // Stopping again is a no-op.
        sm.stop_workers().unwrap();
    }

    #[test]
    fn test_local_state_carries_only_local_record() {
        let sm = manager(4);
        sm.import_state(payload(vec![(9, remote("node-9", 0, Utc::now()))]))
            .unwrap();

        let payload = sm.local_state();
        assert_eq!(payload.len(), 1);
        assert!(payload.contains_key(&4));
    }
}
