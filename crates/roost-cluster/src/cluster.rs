//! Cluster façade
//!
//! Wires the state manager, the transport hooks, the broadcast queue and the
//! orchestrator to one gossip transport instance. The transport itself is
//! supplied by a factory so anything honoring the contract plugs in; the
//! in-process [`crate::transport::memory::MemoryHub`] is the reference.

use crate::broadcast::{Messenger, TransmitQueue, RETRANSMIT_MULT};
use crate::config::ClusterConfig;
use crate::delegate::ClusterDelegate;
use crate::error::{ClusterError, Result};
use crate::events::ClusterEvents;
use crate::fsm::Event;
use crate::orchestrator::Orchestrator;
use crate::state::{ClusterState, NodeId, Phase};
use crate::state_manager::StateManager;
use crate::transport::{Gossip, GossipHooks, TransportOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Backoff between seed join attempts
const JOIN_RETRY: Duration = Duration::from_secs(1);

/// One coordinated node: state, transport and orchestration
pub struct Cluster {
    config: ClusterConfig,
    state: Arc<StateManager>,
    messenger: Messenger,
    transport: Arc<dyn Gossip>,
    shutdown_tx: broadcast::Sender<()>,
    orchestrator: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Cluster {
    /// Build a node and bring it into the cluster.
    ///
    /// The factory receives the network identity and the two transport hooks
    /// and returns a running transport. Nodes with seeds perform the initial
    /// join here, retrying once a second within `join_timeout_s`; the first
    /// node of a fresh cluster skips the join and rests at `idle`.
    pub async fn create<F>(config: ClusterConfig, factory: F) -> Result<Self>
    where
        F: FnOnce(TransportOptions, GossipHooks) -> Result<Arc<dyn Gossip>>,
    {
        config.validate()?;

        let node_name = config.node_name();
        let state = Arc::new(StateManager::new(
            config.node_id,
            node_name.clone(),
            config.workers.clone(),
        ));

        let queue = Arc::new(TransmitQueue::new(RETRANSMIT_MULT));
        let delegate = Arc::new(ClusterDelegate::new(
            config.node_id,
            state.clone(),
            queue.clone(),
        ));

        let (join_tx, join_rx) = tokio::sync::mpsc::unbounded_channel();
        let (leave_tx, leave_rx) = tokio::sync::mpsc::unbounded_channel();
        let events = Arc::new(ClusterEvents::new(
            config.debug,
            node_name.clone(),
            join_tx,
            leave_tx,
        ));

        let transport = factory(
            config.transport_options(),
            GossipHooks {
                delegate,
                events,
            },
        )?;

        {
            let transport = transport.clone();
            queue.set_num_nodes(move || transport.num_members());
        }

        let messenger = Messenger::new(queue);
        let (shutdown_tx, _) = broadcast::channel(1);

        if config.first || config.join_nodes.is_empty() {
            info!(node = %node_name, "bootstrapping a fresh cluster");
            state.set_phase(Phase::Idle);
        } else {
            join_seeds(&state, transport.as_ref(), &config).await?;
        }

        let orchestrator = Orchestrator::new(
            state.clone(),
            messenger.clone(),
            &config,
            join_rx,
            leave_rx,
            shutdown_tx.subscribe(),
        );
        let handle = orchestrator.spawn();

        Ok(Self {
            config,
            state,
            messenger,
            transport,
            shutdown_tx,
            orchestrator: Mutex::new(Some(handle)),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The state capability, for callers observing the replica directly
    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// The user-broadcast capability
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_phase(&self) -> Phase {
        self.state.current_phase()
    }

    /// Copy of the local replica, for display and tests
    pub fn snapshot(&self) -> ClusterState {
        self.state.snapshot()
    }

    /// Stop the orchestrator, then shut the transport down.
    ///
    /// Returns the orchestrator's terminal result, so an invariant violation
    /// that stopped it mid-run surfaces here.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        let handle = self.orchestrator.lock().take();
        let result = match handle {
            Some(handle) => handle.await.map_err(ClusterError::from).and_then(|r| r),
            None => Ok(()),
        };

        self.transport.shutdown().await?;
        info!(node = %self.state.local_node_name(), "cluster shut down");
        result
    }
}

/// Initial seed join with retry backoff bounded by `join_timeout_s`
async fn join_seeds(
    state: &StateManager,
    transport: &dyn Gossip,
    config: &ClusterConfig,
) -> Result<()> {
    state.trigger(Event::Join)?;

    let deadline = Instant::now() + config.join_timeout();
    loop {
        match transport.join(&config.join_nodes).await {
            Ok(contacted) => {
                let members = transport.members();
                info!(
                    node = %state.local_node_name(),
                    contacted,
                    members = members.len(),
                    "joined cluster"
                );
                if members.len() < config.join_nodes_num {
                    warn!(
                        members = members.len(),
                        expected = config.join_nodes_num,
                        "fewer members than expected after join"
                    );
                }
                state.trigger(Event::Joined)?;
                return Ok(());
            }
            Err(e) if Instant::now() + JOIN_RETRY > deadline => {
                return Err(ClusterError::JoinFailed(format!(
                    "no seed reachable within {}s: {e}",
                    config.join_timeout_s
                )));
            }
            Err(e) => {
                warn!(error = %e, "seed join failed, retrying");
                sleep(JOIN_RETRY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;

    fn config(id: NodeId, first: bool, seeds: Vec<String>) -> ClusterConfig {
        let mut cfg = ClusterConfig::new(id);
        cfg.bind_addr = "127.0.0.1".into();
        cfg.bind_port = 7000 + id;
        cfg.first = first;
        cfg.join_nodes = seeds;
        cfg.join_nodes_num = 1;
        cfg
    }

    async fn create(hub: &MemoryHub, cfg: ClusterConfig) -> Result<Cluster> {
        Cluster::create(cfg, |opts, hooks| {
            hub.create(opts, hooks).map(|g| g as Arc<dyn Gossip>)
        })
        .await
    }

    #[tokio::test]
    async fn test_first_node_bootstraps_idle() {
        let hub = MemoryHub::new();
        let cluster = create(&hub, config(1, true, vec![])).await.unwrap();

        assert_eq!(cluster.current_phase(), Phase::Idle);
        assert_eq!(cluster.node_id(), 1);
        assert!(!cluster.is_leader());
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_without_reachable_seed_fails() {
        let hub = MemoryHub::new();
        let mut cfg = config(2, false, vec!["127.0.0.1:9999".into()]);
        cfg.join_timeout_s = 1;

        let err = create(&hub, cfg).await.unwrap_err();
        assert!(matches!(err, ClusterError::JoinFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let hub = MemoryHub::new();
        let err = create(&hub, config(0, true, vec![])).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));
    }
}
