//! # Roost Cluster
//!
//! Gossip-driven coordination for a group of identical worker processes:
//! - **Replicated state**: per-node records with last-writer-wins merge
//! - **Leader election**: min-id fixpoint over eventually consistent views
//! - **Worker assignment**: deterministic modular striping over a shared catalog
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Roost Node                          │
//! ├───────────────┬───────────────────┬──────────────────────────┤
//! │   Transport   │   StateManager    │       Orchestrator       │
//! │   (gossip)    │   (replica+FSM)   │   (reconfiguration)      │
//! ├───────────────┼───────────────────┼──────────────────────────┤
//! │ • join/leave  │ • LWW merge       │ • stop → assemble        │
//! │ • push/pull   │ • election check  │   → elect → assign       │
//! │ • broadcasts  │ • worker slices   │   → start                │
//! └───────────────┴───────────────────┴──────────────────────────┘
//! ```
//!
//! Membership discovery and failure detection belong to an external
//! SWIM-style transport plugged in through the [`transport`] traits; the
//! in-process [`transport::memory::MemoryHub`] backs tests and the console
//! runner. All coordination state lives in one [`StateManager`] per process;
//! the [`Orchestrator`] is the only writer of reconfiguration transitions,
//! reacting to join/leave events by re-striping the worker catalog across
//! the live members.
//!
//! ## Example
//!
//! ```rust,ignore
//! use roost_cluster::{Cluster, ClusterConfig, MemoryHub};
//!
//! let hub = MemoryHub::new();
//! let mut config = ClusterConfig::new(1);
//! config.first = true;
//! let cluster = Cluster::create(config, |opts, hooks| {
//!     hub.create(opts, hooks).map(|g| g as _)
//! }).await?;
//! ```

pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod delegate;
pub mod error;
pub mod events;
pub mod fsm;
pub mod orchestrator;
pub mod protocol;
pub mod state;
pub mod state_manager;
pub mod transport;

// Re-export main types
pub use broadcast::{Messenger, TransmitQueue, RETRANSMIT_MULT};
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use delegate::ClusterDelegate;
pub use error::{ClusterError, Result};
pub use events::ClusterEvents;
pub use fsm::{Event, Fsm, Transition};
pub use orchestrator::{MembershipChange, Orchestrator};
pub use protocol::{NodeMeta, SelectLeaderMessage, StatePayload};
pub use state::{ClusterState, NodeId, NodeState, Phase, WorkerId, NO_LEADER};
pub use state_manager::StateManager;
pub use transport::memory::{MemoryGossip, MemoryHub};
pub use transport::{Delegate, EventDelegate, Gossip, GossipHooks, Member, TransportOptions};
