//! Shared context types threaded through the pipeline stages. Splitting these
//! out of the stage modules mirrors the teacher's `pipeline/context.rs`,
//! which defines the one context trait every stage/channel depends on.

use openmates_core::types::{ChatId, Message, TaskId, UserId};

/// A settings/memory category an app exposes, as surfaced to postprocess
/// Phase 1 (SPEC_FULL.md §4.G). Grounded on
/// `extract_settings_memory_categories` (original_source `postprocessor.py`).
#[derive(Debug, Clone)]
pub struct MemoryCategoryInfo {
    pub id: String,
    pub description: String,
}

/// Per-task context available to every pipeline stage.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub is_incognito: bool,
    pub available_apps: Vec<String>,
    pub available_memory_categories: Vec<MemoryCategoryInfo>,
}

/// Shared read-only inputs to both postprocess phases (SPEC_FULL.md §4.G.1):
/// Phase 2 takes a `Phase1Output` by value, so `phase2` is simply unreachable
/// from code that hasn't produced one.
#[derive(Debug, Clone)]
pub struct PostprocessContext {
    pub task: TaskContext,
    pub user_message: String,
    pub assistant_response: String,
    pub chat_summary: String,
    pub chat_tags: Vec<String>,
    pub history: Vec<Message>,
}
