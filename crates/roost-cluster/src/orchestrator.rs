//! Serialized reconfiguration loop
//!
//! One orchestrator task per cluster instance owns every reconfiguration
//! event. It is the only caller of FSM triggers for the pipeline events, so
//! multi-phase transitions never interleave. A newer membership event
//! supersedes the in-flight pipeline: the pipeline future is dropped at its
//! next polling tick and the loop starts over with the fresh event, so under
//! a burst only the final event's post-state matters.

use crate::broadcast::Messenger;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::fsm::Event;
use crate::state::{NodeId, Phase};
use crate::state_manager::StateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Poll interval inside pipeline phases
const TICK: Duration = Duration::from_secs(1);

/// A membership event as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Join(NodeId),
    Leave(NodeId),
}

pub struct Orchestrator {
    state: Arc<StateManager>,
    messenger: Messenger,
    assemble_timeout: Duration,
    elect_timeout: Duration,
    join_rx: mpsc::UnboundedReceiver<NodeId>,
    leave_rx: mpsc::UnboundedReceiver<NodeId>,
    shutdown: broadcast::Receiver<()>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<StateManager>,
        messenger: Messenger,
        config: &ClusterConfig,
        join_rx: mpsc::UnboundedReceiver<NodeId>,
        leave_rx: mpsc::UnboundedReceiver<NodeId>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            state,
            messenger,
            assemble_timeout: config.assemble_timeout(),
            elect_timeout: config.elect_timeout(),
            join_rx,
            leave_rx,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let Orchestrator {
            state,
            messenger,
            assemble_timeout,
            elect_timeout,
            mut join_rx,
            mut leave_rx,
            mut shutdown,
        } = self;

        let mut next: Option<MembershipChange> = None;
        loop {
            let change = match next.take() {
                Some(change) => change,
                None => tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    Some(id) = join_rx.recv() => MembershipChange::Join(id),
                    Some(id) = leave_rx.recv() => MembershipChange::Leave(id),
                    else => return Ok(()),
                },
            };

            let pipeline = run_pipeline(&state, &messenger, assemble_timeout, elect_timeout, change);
            tokio::pin!(pipeline);

            let outcome = tokio::select! {
                res = &mut pipeline => Some(res),
                _ = shutdown.recv() => {
                    debug!(?change, error = %ClusterError::Cancelled, "shut down mid-pipeline");
                    return Ok(());
                }
                Some(id) = join_rx.recv() => {
                    next = Some(MembershipChange::Join(id));
                    None
                }
                Some(id) = leave_rx.recv() => {
                    next = Some(MembershipChange::Leave(id));
                    None
                }
            };

            match outcome {
                None => {
                    debug!(?change, error = %ClusterError::Cancelled, "pipeline superseded");
                }
                Some(Ok(())) => {
                    debug!(?change, "reconfiguration complete");
                }
                Some(Err(e)) if e.is_fatal() => {
                    error!(error = %e, "unrecoverable state damage, stopping orchestrator");
                    return Err(e);
                }
                Some(Err(e @ ClusterError::Timeout { .. })) => {
                    warn!(?change, error = %e, "pipeline timed out");
                }
                Some(Err(e)) => {
                    warn!(?change, error = %e, "pipeline abandoned");
                }
            }
        }
    }
}

async fn run_pipeline(
    state: &StateManager,
    messenger: &Messenger,
    assemble_timeout: Duration,
    elect_timeout: Duration,
    change: MembershipChange,
) -> Result<()> {
    let deadline = Instant::now() + assemble_timeout;

    match change {
        MembershipChange::Join(id) => {
            info!(node = %state.local_node_name(), peer = id, "reconfiguring after join");
            settle(state)?;
            assemble(state, Some(id), deadline).await?;
            elect(state, messenger, deadline, elect_timeout).await?;
            assign(state)?;
            start(state)?;
        }
        MembershipChange::Leave(id) => {
            info!(node = %state.local_node_name(), peer = id, "reconfiguring after leave");
            settle(state)?;
            if !state.remove_node(id)? {
                debug!(peer = id, "departed node was not in the replica");
            }
            assemble(state, None, deadline).await?;
            elect(state, messenger, deadline, elect_timeout).await?;
            // No start on the leave path: the node rests at idle until the
            // next membership event.
            assign(state)?;
        }
    }

    Ok(())
}

/// Drive the FSM from any re-entry state back to `idle`/`configuring`,
/// stopping local workers on the way out of `working`.
fn settle(state: &StateManager) -> Result<()> {
    loop {
        match state.current_phase() {
            Phase::Idle | Phase::Configuring => return Ok(()),
            Phase::Working => {
                state.trigger(Event::Stop)?;
                state.stop_workers()?;
                state.trigger(Event::Stopped)?;
            }
            Phase::Stopping => {
                state.stop_workers()?;
                state.trigger(Event::Stopped)?;
            }
            Phase::Assembling => {
                state.trigger(Event::Finish)?;
            }
            Phase::Electing => {
                state.trigger(Event::Elected)?;
            }
            Phase::Assigning => {
                state.trigger(Event::Assigned)?;
            }
            phase @ (Phase::Starting | Phase::Joining) => {
                return Err(ClusterError::InvalidTransition {
                    event: Event::Stop,
                    phase,
                });
            }
        }
    }
}

/// Pass through `assembling` to `configuring`, waiting for the given peer's
/// state to arrive via push/pull. With nothing to wait for (leave path, or
/// the peer already merged) the passthrough is immediate.
async fn assemble(state: &StateManager, waiting_for: Option<NodeId>, deadline: Instant) -> Result<()> {
    state.trigger(Event::Assemble)?;

    if let Some(id) = waiting_for {
        if state.has_node(id) {
            debug!(peer = id, "peer state already merged");
        } else {
            while !state.has_node(id) {
                tick(deadline, "assemble").await?;
            }
        }
    }

    state.trigger(Event::Assembled)
}

/// Poll the election to its fixpoint: every known record agreeing on the
/// minimal node id. The node that finds itself leader announces it once.
async fn elect(
    state: &StateManager,
    messenger: &Messenger,
    pipeline_deadline: Instant,
    elect_timeout: Duration,
) -> Result<()> {
    let deadline = pipeline_deadline.min(Instant::now() + elect_timeout);

    state.trigger(Event::Elect)?;
    while !state.elect_leader() {
        tick(deadline, "elect").await?;
    }
    state.trigger(Event::Elected)?;

    if state.is_leader() {
        info!(node = %state.local_node_name(), "elected as leader");
        if let Err(e) = messenger.select_leader(state.local_node_id()) {
            warn!(error = %e, "leader announcement failed");
        }
    }
    Ok(())
}

fn assign(state: &StateManager) -> Result<()> {
    state.trigger(Event::Assign)?;
    state.assign_workers()?;
    state.trigger(Event::Assigned)
}

fn start(state: &StateManager) -> Result<()> {
    state.trigger(Event::Start)?;
    state.start_workers()?;
    state.trigger(Event::Started)
}

/// One polling tick, bounded by the phase deadline
async fn tick(deadline: Instant, phase: &'static str) -> Result<()> {
    let now = Instant::now();
    if now >= deadline {
        return Err(ClusterError::Timeout { phase });
    }
    sleep(TICK.min(deadline - now)).await;
    Ok(())
}
