//! Per-task state machine and the active-task cancellation registry
//! (SPEC_FULL.md §4.H). Grounded on `skynet-gateway/src/app.rs`'s
//! `active_operations: DashMap<String, CancellationToken>` and
//! `stop.rs::execute_stop`'s drain-and-cancel pattern, narrowed from "cancel
//! everything" to "cancel one task" plus the idempotency check §4.H's
//! "Idempotency" paragraph asks for.

use dashmap::DashMap;
use openmates_core::types::TaskId;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{OrchestratorError, Result};

/// `NEW → PRE → MAIN_STREAM → (TOOL_LOOP ↻) → POST → DONE`, with `CANCELLED`/
/// `FAILED` reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Pre,
    MainStream,
    ToolLoop,
    Post,
    Done,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled | TaskState::Failed)
    }
}

struct TaskHandle {
    cancel: CancellationToken,
    state: TaskState,
}

/// Tracks every in-flight task's cancel signal and coarse state, and records
/// completed task ids so a resubmission is rejected rather than silently
/// reprocessed (§4.H "Idempotency").
#[derive(Default)]
pub struct TaskRegistry {
    active: DashMap<String, TaskHandle>,
    completed: DashMap<String, ()>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking `task_id`. Returns its cancel token, or an error if the
    /// same id is already active or already completed.
    pub fn begin(&self, task_id: &TaskId) -> Result<CancellationToken> {
        if self.completed.contains_key(task_id.as_str()) {
            return Err(OrchestratorError::AlreadyProcessed(task_id.to_string()));
        }
        if self.active.contains_key(task_id.as_str()) {
            return Err(OrchestratorError::AlreadyInFlight(task_id.to_string()));
        }
        let cancel = CancellationToken::new();
        self.active.insert(task_id.as_str().to_string(), TaskHandle { cancel: cancel.clone(), state: TaskState::New });
        Ok(cancel)
    }

    pub fn transition(&self, task_id: &TaskId, state: TaskState) {
        if let Some(mut handle) = self.active.get_mut(task_id.as_str()) {
            handle.state = state;
        }
    }

    pub fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.active.get(task_id.as_str()).map(|h| h.state)
    }

    /// Mark a task finished (any terminal state) and stop tracking it as active.
    pub fn finish(&self, task_id: &TaskId) {
        self.active.remove(task_id.as_str());
        self.completed.insert(task_id.as_str().to_string(), ());
    }

    /// Cancel one in-flight task. A no-op if it isn't active.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        if let Some(handle) = self.active.get(task_id.as_str()) {
            handle.cancel.cancel();
            info!(task_id = %task_id, "task cancelled");
            true
        } else {
            false
        }
    }
}
