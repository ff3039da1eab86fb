//! Preprocess stage (SPEC_FULL.md §4.D): one forced-tool call against a
//! small/fast model that classifies the turn. Mandatory — a failure aborts
//! the task with `PREPROCESS_FAILED`, unlike postprocess which is best-effort.

use openmates_core::types::{Message, ModelTier};
use openmates_providers::{chat_with_retry, ChatRequest, LlmProvider, RetryPolicy, ToolChoice, ToolDefinition};
use tracing::warn;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// Qualified skill names (`app_id.skill_id`) the main stage should have
    /// available as tools this turn.
    pub skills: Vec<String>,
    pub model_tier: ModelTier,
    pub summary: Option<String>,
    pub tags: Vec<String>,
}

impl Default for PreprocessOutput {
    fn default() -> Self {
        Self { skills: Vec::new(), model_tier: ModelTier::Balanced, summary: None, tags: Vec::new() }
    }
}

/// Run the classification call. `tool` is the already-templated
/// (`PromptTemplate::render`'d) tool definition for this task.
pub async fn run_preprocess(provider: &dyn LlmProvider, model: &str, tool: ToolDefinition, history: &[Message], retry: RetryPolicy) -> Result<PreprocessOutput> {
    let mut req = ChatRequest::new(model.to_string(), String::new(), history.to_vec());
    req.tools = vec![tool];
    req.tool_choice = ToolChoice::Required;

    let response = chat_with_retry(provider, &req, retry).await?;
    if !response.success {
        return Err(PipelineError::PreprocessFailed(response.error.unwrap_or_else(|| "provider returned no error detail".to_string())));
    }

    let Some(call) = response.tool_calls.into_iter().next() else {
        return Err(PipelineError::PreprocessFailed("provider did not return the forced tool call".to_string()));
    };

    let Some(args) = call.arguments_parsed else {
        return Err(PipelineError::PreprocessFailed(call.parse_error.unwrap_or_else(|| "tool arguments were not valid JSON".to_string())));
    };

    Ok(parse_preprocess_args(&args))
}

fn parse_preprocess_args(args: &serde_json::Value) -> PreprocessOutput {
    let skills = match args.get("action") {
        Some(serde_json::Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect(),
        Some(serde_json::Value::String(s)) if s != "none" && !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };

    let model_tier = args
        .get("model_selector")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<ModelTier>().ok())
        .unwrap_or_else(|| {
            warn!("preprocess returned no usable model_selector; defaulting to balanced");
            ModelTier::Balanced
        });

    let summary = args.get("summary").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string);

    let tags = args
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();

    PreprocessOutput { skills, model_tier, summary, tags }
}
