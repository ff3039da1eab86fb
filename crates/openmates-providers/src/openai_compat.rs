use async_trait::async_trait;
use openmates_core::types::{Message, Role};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::{ChatRequest, LlmProvider, ResolvedToolChoice, Usage, UnifiedResponse};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};
use crate::tool_reassembly::ToolCallAccumulator;

/// Adapter for any OpenAI-compatible `/v1/chat/completions` endpoint (OpenAI
/// itself, Mistral, Groq, and any vendor listed in the provider registry).
/// Generalizes `skynet-agent/src/openai.rs::OpenAiProvider`, whose
/// Anthropic-raw-message conversion this version replaces with a direct mapping
/// from `openmates_core::types::Message` since the pipeline never produces
/// Anthropic-style content blocks.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
    chat_path: String,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, api_key: String, base_url: String) -> Self {
        Self::with_path(name, api_key, base_url, "/v1/chat/completions".to_string())
    }

    pub fn with_path(name: impl Into<String>, api_key: String, base_url: String, chat_path: String) -> Self {
        Self { client: reqwest::Client::new(), provider_name: name.into(), api_key, base_url, chat_path }
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.chat_path)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, req: &ChatRequest) -> Result<UnifiedResponse> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, provider = %self.provider_name, "sending chat request");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, provider = %self.provider_name, "api error");
            return Err(ProviderError::Api { status, message: text });
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }

    async fn chat_stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, provider = %self.provider_name, "sending streaming chat request");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, provider = %self.provider_name, "streaming api error");
            return Err(ProviderError::Api { status, message: text });
        }

        process_openai_stream(resp, tx).await;
        Ok(())
    }
}

fn tool_choice_json(req: &ChatRequest) -> Option<Value> {
    match req.tool_choice.resolve(&req.tools) {
        ResolvedToolChoice::Auto if req.tools.is_empty() => None,
        ResolvedToolChoice::Auto => Some(json!("auto")),
        ResolvedToolChoice::None => Some(json!("none")),
        ResolvedToolChoice::Specific(name) => Some(json!({ "type": "function", "function": { "name": name } })),
    }
}

fn message_to_json(m: &Message) -> Value {
    match m.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if !m.tool_calls.is_empty() => {
            let tool_calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": { "name": tc.function_name, "arguments": tc.arguments_raw },
                    })
                })
                .collect();
            let content = if m.content.is_empty() { Value::Null } else { json!(m.content) };
            json!({ "role": "assistant", "content": content, "tool_calls": tool_calls })
        }
        other => json!({ "role": other.to_string(), "content": m.content }),
    }
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": req.system })];
    messages.extend(req.messages.iter().map(message_to_json));

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| json!({ "type": "function", "function": { "name": t.name, "description": t.description, "parameters": t.input_schema } }))
            .collect();
        body["tools"] = json!(tools);
    }
    if let Some(choice) = tool_choice_json(req) {
        body["tool_choice"] = choice;
    }

    body
}

pub(crate) fn parse_response(resp: ApiResponse) -> UnifiedResponse {
    use openmates_core::types::ToolCall;

    let choice = resp.choices.into_iter().next();
    let content = choice.as_ref().and_then(|c| c.message.content.as_deref()).unwrap_or("").to_string();

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall::finalize(tc.id.clone(), tc.function.name.clone(), tc.function.arguments.clone()))
                .collect()
        })
        .unwrap_or_default();

    let raw_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();
    let stop_reason = if raw_reason == "tool_calls" { "tool_use".to_string() } else { raw_reason };

    let usage = Usage {
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
    };

    UnifiedResponse::ok(content, resp.model, usage, stop_reason, tool_calls)
}

/// Consume an OpenAI-compatible SSE byte stream, reassembling tool-call deltas
/// via `ToolCallAccumulator`. Grounded on
/// `skynet-agent/src/openai.rs::process_openai_stream`, which only forwarded
/// text deltas; this version adds tool-call handling because SPEC_FULL.md §4.F
/// requires streamed tool calls, not just streamed text.
pub(crate) async fn process_openai_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut line_buf = String::new();
    let mut acc = ToolCallAccumulator::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                if data.trim() == "[DONE]" {
                    continue;
                }

                let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else { continue };

                if let Some(usage) = &chunk_resp.usage {
                    tokens_in = usage.prompt_tokens;
                    tokens_out = usage.completion_tokens;
                }

                for choice in &chunk_resp.choices {
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            if let Some(finalized) = acc.on_content_chunk() {
                                if tx.send(StreamEvent::ToolCallFinal(finalized)).await.is_err() {
                                    return;
                                }
                            }
                            if tx.send(StreamEvent::TextDelta(content.clone())).await.is_err() {
                                return;
                            }
                        }
                    }

                    if let Some(tool_calls) = &choice.delta.tool_calls {
                        for tc in tool_calls {
                            let name = tc.function.as_ref().and_then(|f| f.name.as_deref());
                            let args = tc.function.as_ref().and_then(|f| f.arguments.as_deref());
                            if let Some(finalized) = acc.push_delta(tc.index, tc.id.as_deref(), name, args) {
                                if tx.send(StreamEvent::ToolCallFinal(finalized)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }

                    if let Some(reason) = &choice.finish_reason {
                        if reason == "tool_calls" {
                            if let Some(finalized) = acc.finish() {
                                if tx.send(StreamEvent::ToolCallFinal(finalized)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    if let Some(finalized) = acc.finish() {
        let _ = tx.send(StreamEvent::ToolCallFinal(finalized)).await;
    }
    let _ = tx.send(StreamEvent::Usage { tokens_in, tokens_out }).await;
    let _ = tx.send(StreamEvent::End).await;
}

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) model: String,
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ChatMessage,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ChatMessage {
    pub(crate) content: Option<String>,
    pub(crate) tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
pub(crate) struct ApiToolCall {
    pub(crate) id: String,
    pub(crate) function: ApiFunction,
}

#[derive(Deserialize)]
pub(crate) struct ApiFunction {
    pub(crate) name: String,
    pub(crate) arguments: String,
}

#[derive(Deserialize)]
pub(crate) struct ApiUsage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
