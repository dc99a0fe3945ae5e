//! Engine state types.
//!
//! # State Transitions
//!
//! ```text
//!            run()
//! Created ─────────▶ Checkpointing ──▶ FullSync ──▶ Tailing
//!                          │              │            │
//!                          │              │  shutdown  │
//!                          │              └────┬───────┘
//!                          │                   ▼
//!                          │             ShuttingDown ──▶ Stopped
//!                          │                   │
//!                          └──── fatal error ──┴──────▶ Failed
//! ```
//!
//! - **Created**: Built, not started.
//! - **Checkpointing**: Persisting the start anchor.
//! - **FullSync**: Copying collections one after another.
//! - **Tailing**: Applying change-log entries.
//! - **ShuttingDown**: Writing the shutdown marker.
//! - **Stopped**: Clean exit.
//! - **Failed**: Fatal error; see logs.

use crate::checkpoint::LogicalTime;
use crate::full_sync::FullSyncReport;
use crate::tailer::TailerReport;

/// State of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Checkpointing,
    FullSync,
    Tailing,
    ShuttingDown,
    Stopped,
    Failed,
}

impl EngineState {
    /// `true` once the engine can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Checkpointing => write!(f, "Checkpointing"),
            EngineState::FullSync => write!(f, "FullSync"),
            EngineState::Tailing => write!(f, "Tailing"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Start anchor the run tailed from.
    pub anchor: LogicalTime,
    /// One entry per collection that finished full sync, in sync order.
    pub collections: Vec<FullSyncReport>,
    /// Present if tailing started.
    pub tailer: Option<TailerReport>,
    /// Value written to the shutdown marker.
    pub shutdown_position: LogicalTime,
}

impl RunReport {
    /// Documents copied across all collections.
    pub fn documents_copied(&self) -> u64 {
        self.collections.iter().map(|c| c.documents).sum()
    }
}
