use async_trait::async_trait;
use openmates_core::types::{Message, Role, ToolCall};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::{ChatRequest, LlmProvider, ResolvedToolChoice, Usage, UnifiedResponse};

/// Google Gemini adapter. Uses Gemini's native `generateContent` /
/// `streamGenerateContent` envelope rather than the OpenAI-compatible family:
/// its `functionCall`/`functionResponse` parts and `safetyRatings` fields don't
/// map cleanly onto the OpenAI dialect (SPEC_FULL.md §4.B.1). Wire shape
/// grounded on `gemini_image.py` (original_source), adapted here from image
/// generation to chat + tool calling.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self { client: reqwest::Client::new(), api_key, base_url: "https://generativelanguage.googleapis.com".to_string() }
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { client: reqwest::Client::new(), api_key, base_url }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}?key={}", self.base_url.trim_end_matches('/'), model, method, self.api_key)
    }
}

fn role_to_gemini(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "model",
        Role::System => "user",
    }
}

fn message_to_content(m: &Message) -> Value {
    if m.role == Role::Tool {
        return json!({
            "role": "user",
            "parts": [{ "functionResponse": { "name": m.tool_call_id.clone().unwrap_or_default(), "response": { "content": m.content } } }],
        });
    }
    if m.role == Role::Assistant && !m.tool_calls.is_empty() {
        let mut parts: Vec<Value> = Vec::new();
        if !m.content.is_empty() {
            parts.push(json!({ "text": m.content }));
        }
        for tc in &m.tool_calls {
            parts.push(json!({ "functionCall": { "name": tc.function_name, "args": tc.arguments_parsed.clone().unwrap_or(json!({})) } }));
        }
        return json!({ "role": "model", "parts": parts });
    }
    json!({ "role": role_to_gemini(m.role), "parts": [{ "text": m.content }] })
}

fn build_request_body(req: &ChatRequest) -> Value {
    let contents: Vec<Value> = req.messages.iter().map(message_to_content).collect();

    let mut body = json!({
        "contents": contents,
        "systemInstruction": { "parts": [{ "text": req.system }] },
        "generationConfig": { "maxOutputTokens": req.max_tokens },
    });
    if let Some(t) = req.temperature {
        body["generationConfig"]["temperature"] = json!(t);
    }

    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.input_schema }))
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);

        let mode = match req.tool_choice.resolve(&req.tools) {
            ResolvedToolChoice::Auto => "AUTO",
            ResolvedToolChoice::None => "NONE",
            ResolvedToolChoice::Specific(_) => "ANY",
        };
        let mut function_calling_config = json!({ "mode": mode });
        if let ResolvedToolChoice::Specific(name) = req.tool_choice.resolve(&req.tools) {
            function_calling_config["allowedFunctionNames"] = json!([name]);
        }
        body["toolConfig"] = json!({ "functionCallingConfig": function_calling_config });
    }

    body
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<UnifiedResponse> {
        let body = build_request_body(req);
        debug!(model = %req.model, "sending gemini request");

        let resp = self.client.post(self.endpoint(&req.model, "generateContent")).json(&body).send().await?;
        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited { retry_after_ms: 5000 });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "gemini api error");
            return Err(ProviderError::Api { status, message: text });
        }

        let api_resp: GeminiResponse = resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp, req.model.clone()))
    }

    // Gemini's streaming function-call parts arrive whole (not fragmented like
    // OpenAI's index-keyed deltas), so the default `chat_stream` fallback —
    // one non-streaming call synthesized into TextDelta + ToolCallFinal + End —
    // is both correct and simplest here; no adapter-specific SSE parsing needed.
}

fn parse_response(resp: GeminiResponse, model: String) -> UnifiedResponse {
    let candidate = match resp.candidates.into_iter().next() {
        Some(c) => c,
        None => return UnifiedResponse::err("gemini returned no candidates"),
    };

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for part in candidate.content.parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            let args_raw = fc.args.to_string();
            tool_calls.push(ToolCall::finalize(format!("gemini-{}", fc.name), fc.name, args_raw));
        }
    }

    let stop_reason = if !tool_calls.is_empty() { "tool_use".to_string() } else { candidate.finish_reason.unwrap_or_default() };

    let usage = Usage {
        tokens_in: resp.usage_metadata.as_ref().map(|u| u.prompt_token_count).unwrap_or(0),
        tokens_out: resp.usage_metadata.as_ref().map(|u| u.candidates_token_count).unwrap_or(0),
    };

    let _ = model;
    UnifiedResponse::ok(text, String::new(), usage, stop_reason, tool_calls)
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: GeminiContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Value,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}
