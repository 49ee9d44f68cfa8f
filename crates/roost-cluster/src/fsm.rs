//! Per-node finite-state machine
//!
//! The transition table is the contract every reconfiguration step runs
//! through: an event fired from an illegal source state fails with
//! [`ClusterError::InvalidTransition`] and leaves the state untouched.
//! `assemble` is accepted from both `idle` and `configuring` so an
//! interrupted reconfiguration can re-enter the pipeline from either side.

use crate::error::{ClusterError, Result};
use crate::state::Phase;
use std::fmt;

/// State machine events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Join,
    Joined,
    Assemble,
    Assembled,
    Elect,
    Elected,
    Assign,
    Assigned,
    Start,
    Started,
    Stop,
    Stopped,
    Finish,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Join => "join",
            Event::Joined => "joined",
            Event::Assemble => "assemble",
            Event::Assembled => "assembled",
            Event::Elect => "elect",
            Event::Elected => "elected",
            Event::Assign => "assign",
            Event::Assigned => "assigned",
            Event::Start => "start",
            Event::Started => "started",
            Event::Stop => "stop",
            Event::Stopped => "stopped",
            Event::Finish => "finish",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successfully applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub event: Event,
    pub from: Phase,
    pub to: Phase,
}

/// The per-node state machine; `starting` initially, no terminal state
#[derive(Debug)]
pub struct Fsm {
    current: Phase,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            current: Phase::Starting,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Unconditional state set, bootstrap only
    pub fn set(&mut self, phase: Phase) {
        self.current = phase;
    }

    /// Fire an event; on success the state advances and the applied
    /// transition is returned for observation (logging) purposes.
    pub fn trigger(&mut self, event: Event) -> Result<Transition> {
        use Event::*;
        use Phase::*;

        let from = self.current;
        let to = match (event, from) {
            (Join, Starting) => Joining,
            (Joined, Joining) => Idle,
            (Assemble, Idle | Configuring) => Assembling,
            (Assembled, Assembling) => Configuring,
            (Elect, Configuring) => Electing,
            (Elected, Electing) => Configuring,
            (Assign, Configuring) => Assigning,
            (Assigned, Assigning) => Idle,
            (Start, Idle) => Starting,
            (Started, Starting) => Working,
            (Stop, Working) => Stopping,
            (Stopped, Stopping) => Configuring,
            (Finish, Assembling) => Idle,
            _ => return Err(ClusterError::InvalidTransition { event, phase: from }),
        };

        self.current = to;
        Ok(Transition { event, from, to })
    }
}
