//! Run state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Stage of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Idle,
    CheckingConnection,
    InitializingHistory,
    Scanning,
    Locking,
    Validating,
    BackingUp,
    Executing,
    Committing,
    CleaningUp,
    Recovering,
    Completed,
    Failed,
}

impl WorkflowState {
    /// Whether the run may move from `self` to `next`.
    ///
    /// Scanning happens once before the lock is taken, so that a run with
    /// nothing to do never touches the lock, and once more under the lock.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;

        match (self, next) {
            (Idle, CheckingConnection) => true,
            (CheckingConnection, InitializingHistory) => true,
            (InitializingHistory, Scanning) => true,
            (Scanning, Locking | Validating | Completed) => true,
            (Locking, Scanning) => true,
            (Validating, BackingUp | Recovering) => true,
            (BackingUp, Executing | Recovering) => true,
            (Executing, Committing | Recovering) => true,
            (Committing, CleaningUp | Recovering) => true,
            (CleaningUp, Completed) => true,
            (Recovering, Failed) => true,
            // setup stages fail without recovery, nothing was touched yet
            (CheckingConnection | InitializingHistory | Scanning | Locking, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::CheckingConnection => "checking_connection",
            WorkflowState::InitializingHistory => "initializing_history",
            WorkflowState::Scanning => "scanning",
            WorkflowState::Locking => "locking",
            WorkflowState::Validating => "validating",
            WorkflowState::BackingUp => "backing_up",
            WorkflowState::Executing => "executing",
            WorkflowState::Committing => "committing",
            WorkflowState::CleaningUp => "cleaning_up",
            WorkflowState::Recovering => "recovering",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Tracks the stages one run went through
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: WorkflowState,
    history: Vec<WorkflowState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: WorkflowState::Idle,
            history: vec![WorkflowState::Idle],
        }
    }

    pub fn current(&self) -> WorkflowState {
        self.current
    }

    /// Every state visited so far, in order
    pub fn history(&self) -> &[WorkflowState] {
        &self.history
    }

    pub fn advance(&mut self, next: WorkflowState) {
        if !self.current.can_transition_to(next) {
            warn!("Unexpected workflow transition {} -> {}", self.current, next);
        }
        debug!("Workflow {} -> {}", self.current, next);
        self.current = next;
        self.history.push(next);
    }

    /// Move to `Failed`, through `Recovering` when the current stage needs it
    pub fn fail(&mut self) {
        if self.current.can_transition_to(WorkflowState::Recovering) {
            self.advance(WorkflowState::Recovering);
        }
        if self.current != WorkflowState::Failed {
            self.advance(WorkflowState::Failed);
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
