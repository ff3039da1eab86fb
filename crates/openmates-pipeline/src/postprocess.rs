//! Postprocess stage (SPEC_FULL.md §4.G/§4.G.1). Grounded on
//! `original_source/backend/apps/ai/processing/postprocessor.py`'s two-phase
//! shape: Phase 1 classifies the turn against whitelists it's handed, Phase 2
//! is only reachable with a non-empty Phase 1 category selection. Skipped
//! entirely for incognito tasks (caller's responsibility, not this module's —
//! there is nothing incognito-specific to check once we're called).
//!
//! Both phases are best-effort: any provider failure here must never fail the
//! task, so every fallible step degrades to an empty result rather than
//! propagating a `PipelineError`.

use std::collections::HashSet;

use openmates_core::token_estimator::CharDivFourEstimator;
use openmates_providers::{chat_with_retry, ChatRequest, LlmProvider, RetryPolicy, ToolChoice, ToolDefinition};
use tracing::warn;

use crate::context::PostprocessContext;
use crate::history::truncate_to_token_budget;

const PHASE1_TOKEN_BUDGET: usize = 120_000;
const MAX_SUGGESTIONS: usize = 6;
const MAX_SUGGESTION_WORDS: usize = 5;
const MAX_RECOMMENDED_APPS: usize = 5;
const MAX_MEMORY_CATEGORIES: usize = 3;
const MAX_MEMORY_ENTRIES: usize = 3;
const MAX_SUMMARY_WORDS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct Phase1Output {
    pub follow_up_request_suggestions: Vec<String>,
    pub new_chat_request_suggestions: Vec<String>,
    pub harmful_response: u8,
    pub top_recommended_apps_for_user: Vec<String>,
    pub chat_summary: String,
    pub relevant_settings_memory_categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SuggestedMemoryEntry {
    pub app_id: String,
    pub item_type: String,
    pub suggested_title: String,
    pub item_value: serde_json::Value,
}

/// Phase 1: classify the turn. Never fails the task — any error here yields
/// an all-empty `Phase1Output`.
pub async fn run_phase1(provider: &dyn LlmProvider, model: &str, tool: ToolDefinition, ctx: &PostprocessContext, retry: RetryPolicy) -> Phase1Output {
    let estimator = CharDivFourEstimator;
    let history = truncate_to_token_budget(&ctx.history, PHASE1_TOKEN_BUDGET, &estimator);

    let mut req = ChatRequest::new(model.to_string(), postprocess_system_prompt(ctx), history);
    req.tools = vec![tool];
    req.tool_choice = ToolChoice::Required;

    let response = match chat_with_retry(provider, &req, retry).await {
        Ok(r) if r.success => r,
        Ok(r) => {
            warn!(error = ?r.error, "postprocess phase 1 call returned an error response");
            return Phase1Output::default();
        }
        Err(e) => {
            warn!(error = %e, "postprocess phase 1 call failed");
            return Phase1Output::default();
        }
    };

    let Some(call) = response.tool_calls.into_iter().next() else {
        warn!("postprocess phase 1 did not return a tool call");
        return Phase1Output::default();
    };

    let Some(args) = call.arguments_parsed else {
        warn!(error = ?call.parse_error, "postprocess phase 1 tool arguments were not valid JSON");
        return Phase1Output::default();
    };

    let available_apps: HashSet<&str> = ctx.task.available_apps.iter().map(String::as_str).collect();
    let available_categories: HashSet<&str> = ctx.task.available_memory_categories.iter().map(|c| c.id.as_str()).collect();

    parse_phase1_args(&args, &available_apps, &available_categories)
}

fn parse_phase1_args(args: &serde_json::Value, available_apps: &HashSet<&str>, available_categories: &HashSet<&str>) -> Phase1Output {
    let short_strings = |key: &str| -> Vec<String> {
        args.get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter(|s| s.split_whitespace().count() <= MAX_SUGGESTION_WORDS)
                    .take(MAX_SUGGESTIONS)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let top_recommended_apps_for_user = args
        .get("top_recommended_apps_for_user")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|app_id| {
                    let keep = available_apps.contains(app_id);
                    if !keep {
                        warn!(app_id, "postprocess recommended an app not in available_apps; dropping");
                    }
                    keep
                })
                .take(MAX_RECOMMENDED_APPS)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let relevant_settings_memory_categories = args
        .get("relevant_settings_memory_categories")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|cat| {
                    let keep = available_categories.contains(cat);
                    if !keep {
                        warn!(category = cat, "postprocess selected a memory category not in available_memory_categories; dropping");
                    }
                    keep
                })
                .take(MAX_MEMORY_CATEGORIES)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let chat_summary = args
        .get("chat_summary")
        .and_then(|v| v.as_str())
        .map(|s| truncate_words(s, MAX_SUMMARY_WORDS))
        .unwrap_or_default();

    let harmful_response = args.get("harmful_response").and_then(|v| v.as_u64()).map(|n| n.min(10) as u8).unwrap_or(0);

    Phase1Output {
        follow_up_request_suggestions: short_strings("follow_up_request_suggestions"),
        new_chat_request_suggestions: short_strings("new_chat_request_suggestions"),
        harmful_response,
        top_recommended_apps_for_user,
        chat_summary,
        relevant_settings_memory_categories,
    }
}

fn truncate_words(s: &str, max_words: usize) -> String {
    s.split_whitespace().take(max_words).collect::<Vec<_>>().join(" ")
}

/// Phase 2: generate suggested memory entries. Only sensible to call when
/// `phase1.relevant_settings_memory_categories` is non-empty — the caller
/// enforces that by construction since this takes the phase 1 output by value.
pub async fn run_phase2(
    provider: &dyn LlmProvider,
    model: &str,
    tool: ToolDefinition,
    ctx: &PostprocessContext,
    phase1: &Phase1Output,
    retry: RetryPolicy,
) -> Vec<SuggestedMemoryEntry> {
    if phase1.relevant_settings_memory_categories.is_empty() {
        return Vec::new();
    }

    let selected: HashSet<&str> = phase1.relevant_settings_memory_categories.iter().map(String::as_str).collect();

    let estimator = CharDivFourEstimator;
    let history = truncate_to_token_budget(&ctx.history, PHASE1_TOKEN_BUDGET, &estimator);
    let mut req = ChatRequest::new(model.to_string(), postprocess_system_prompt(ctx), history);
    req.tools = vec![tool];
    req.tool_choice = ToolChoice::Required;

    let response = match chat_with_retry(provider, &req, retry).await {
        Ok(r) if r.success => r,
        Ok(r) => {
            warn!(error = ?r.error, "postprocess phase 2 call returned an error response");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "postprocess phase 2 call failed");
            return Vec::new();
        }
    };

    let Some(call) = response.tool_calls.into_iter().next() else {
        return Vec::new();
    };
    let Some(args) = call.arguments_parsed else {
        return Vec::new();
    };

    let Some(entries) = args.get("entries").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| parse_memory_entry(entry, &selected))
        .take(MAX_MEMORY_ENTRIES)
        .collect()
}

fn parse_memory_entry(entry: &serde_json::Value, selected: &HashSet<&str>) -> Option<SuggestedMemoryEntry> {
    let app_id = entry.get("app_id")?.as_str()?.to_string();
    let item_type = entry.get("item_type")?.as_str().unwrap_or_default().to_string();
    let suggested_title = entry.get("suggested_title")?.as_str()?.to_string();
    let item_value = entry.get("item_value")?.clone();

    if suggested_title.is_empty() {
        return None;
    }
    if item_value.is_null() || item_value == serde_json::json!({}) {
        return None;
    }
    if !selected.contains(item_type.as_str()) {
        warn!(item_type, "discarding a postprocess memory entry outside the phase 1 category selection");
        return None;
    }

    Some(SuggestedMemoryEntry { app_id, item_type, suggested_title, item_value })
}

fn postprocess_system_prompt(ctx: &PostprocessContext) -> String {
    format!(
        "You are classifying a finished chat turn. Available apps: {}. Available memory categories: {}.",
        ctx.task.available_apps.join(", "),
        ctx.task.available_memory_categories.iter().map(|c| c.id.as_str()).collect::<Vec<_>>().join(", "),
    )
}
