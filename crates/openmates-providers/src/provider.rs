use async_trait::async_trait;
use openmates_core::types::{Message, ToolCall};
use tokio::sync::mpsc;

use crate::error::{ProviderError, Result};
use crate::stream::StreamEvent;

/// JSON-schema-bearing tool description sent to the provider.
/// Grounded on `skynet-agent/src/provider.rs::ToolDefinition`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Canonical tool-choice value (SPEC_FULL.md §4.B) that every adapter maps into
/// its own wire dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Specific(String),
}

impl ToolChoice {
    /// Resolve `Required` against the offered tool set: pin to the only tool when
    /// there is exactly one, otherwise pin to the first (SPEC_FULL.md §4.B).
    pub fn resolve<'a>(&'a self, tools: &'a [ToolDefinition]) -> ResolvedToolChoice<'a> {
        match self {
            ToolChoice::Auto => ResolvedToolChoice::Auto,
            ToolChoice::None => ResolvedToolChoice::None,
            ToolChoice::Specific(name) => ResolvedToolChoice::Specific(name),
            ToolChoice::Required => match tools.first() {
                Some(t) => ResolvedToolChoice::Specific(&t.name),
                None => ResolvedToolChoice::Auto,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedToolChoice<'a> {
    Auto,
    None,
    Specific(&'a str),
}

/// Request to an LLM provider. Grounded on `skynet-agent/src/provider.rs::ChatRequest`.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            messages,
            max_tokens: 4096,
            temperature: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
        }
    }
}

/// Non-streaming response, canonical across every adapter.
#[derive(Debug, Clone)]
pub struct UnifiedResponse {
    pub success: bool,
    pub error: Option<String>,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub stop_reason: String,
    pub raw: Option<serde_json::Value>,
}

impl UnifiedResponse {
    pub fn ok(text: String, model: String, usage: Usage, stop_reason: String, tool_calls: Vec<ToolCall>) -> Self {
        let _ = model;
        Self { success: true, error: None, text: Some(text), tool_calls, usage: Some(usage), stop_reason, raw: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            text: None,
            tool_calls: Vec::new(),
            usage: None,
            stop_reason: String::new(),
            raw: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Common interface every LLM adapter implements (SPEC_FULL.md §4.B). Grounded on
/// `skynet-agent/src/provider.rs::LlmProvider`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: &ChatRequest) -> Result<UnifiedResponse>;

    /// Default: fall back to non-streaming `chat` and synthesize a single
    /// `TextDelta` + `End`, exactly like the teacher's default `send_stream`.
    async fn chat_stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let resp = self.chat(req).await?;
        if let Some(text) = resp.text {
            let _ = tx.send(StreamEvent::TextDelta(text)).await;
        }
        for call in resp.tool_calls {
            let _ = tx.send(StreamEvent::ToolCallFinal(call)).await;
        }
        if let Some(usage) = resp.usage {
            let _ = tx.send(StreamEvent::Usage { tokens_in: usage.tokens_in, tokens_out: usage.tokens_out }).await;
        }
        let _ = tx.send(StreamEvent::End).await;
        Ok(())
    }
}

/// Per-call timeout and backoff budget (SPEC_FULL.md §7). Each config section
/// that names a `*_timeout_secs`/`transient_*` pair produces one of these.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_cap_secs: u64,
}

impl RetryPolicy {
    pub fn new(timeout_secs: u64, max_attempts: u32, backoff_cap_secs: u64) -> Self {
        Self { timeout: Duration::from_secs(timeout_secs), max_attempts, backoff_cap_secs }
    }
}

/// Runs `chat` with the exponential backoff policy from SPEC_FULL.md §7: retry
/// TRANSIENT errors (including a per-attempt timeout) up to `policy.max_attempts`,
/// doubling the delay each time, capped at `policy.backoff_cap_secs`. Grounded on
/// the backoff shape of `skynet-channels/manager.rs` (there applied to channel
/// reconnects; the parameters here are §7's, not theirs).
pub async fn chat_with_retry(provider: &dyn LlmProvider, req: &ChatRequest, policy: RetryPolicy) -> Result<UnifiedResponse> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::time::timeout(policy.timeout, provider.chat(req)).await;
        let result = match outcome {
            Ok(r) => r,
            Err(_) => Err(ProviderError::Timeout(policy.timeout.as_secs())),
        };
        match result {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = Duration::from_secs((1u64 << (attempt - 1)).min(policy.backoff_cap_secs));
                tracing::warn!(provider = provider.name(), attempt, error = %e, "retrying transient provider error");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

use std::time::Duration;
