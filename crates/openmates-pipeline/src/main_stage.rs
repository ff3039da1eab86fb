//! Main stage (SPEC_FULL.md §4.F): the streaming tool-calling loop. Grounded
//! on `skynet-agent/src/tools/tool_loop.rs::run_tool_loop`, generalized from
//! that crate's single non-streaming round to a streaming, capped loop that
//! forwards text deltas through `openmates_aggregator::StreamAggregator` and
//! dispatches tool calls through `openmates_skills::Dispatcher`.

use std::sync::Arc;
use std::time::Duration;

use openmates_aggregator::{Block, StreamAggregator};
use openmates_core::types::{Message, ToolCall};
use openmates_providers::{ChatRequest, LlmProvider, ProviderError, RetryPolicy, StreamEvent, ToolChoice, ToolDefinition, Usage};
use openmates_skills::{DispatchOutcome, Dispatcher, SkillContext};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// Main stage never loops more than this many provider round-trips before
/// forcing a final, tool-free call to produce user-visible text.
pub const MAX_TOOL_ROUNDS: u32 = 4;

/// Sink the main stage forwards aggregated text blocks to for edge delivery
/// (SPEC_FULL.md §4.H step 5: "Stream aggregated blocks to the edge labeled
/// by `message_id`"). Implemented by the orchestrator; kept as a trait here
/// so this crate never depends on the edge transport.
#[async_trait::async_trait]
pub trait BlockSink: Send + Sync {
    async fn send_block(&self, block: &Block);
}

pub struct MainStageOutput {
    pub messages: Vec<Message>,
    pub final_text: String,
    pub usage: Usage,
    /// Every skill dispatch across every round, in execution order — the
    /// orchestrator uses this for §4.H step 6 (Usage Entry + creator-income
    /// recording) and step 7 (credit settlement).
    pub skill_outcomes: Vec<DispatchOutcome>,
}

/// Run the tool-calling loop to completion. `messages` is the already
/// truncated, transformed history (SPEC_FULL.md §4.H steps 1-2) with the
/// latest user turn appended; `tools` is the skill set preselected by
/// preprocess. Returns the full message trace (including every assistant and
/// tool-result message appended this turn) plus the concatenated final text.
pub async fn run_main_stage(
    provider: &dyn LlmProvider,
    model: &str,
    system: &str,
    mut messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    dispatcher: &Dispatcher,
    skill_ctx: &SkillContext,
    sink: &dyn BlockSink,
    retry: RetryPolicy,
) -> Result<MainStageOutput> {
    let mut total_usage = Usage::default();
    let mut final_text = String::new();
    let mut skill_outcomes = Vec::new();

    for round in 0..MAX_TOOL_ROUNDS {
        let forced_final = round + 1 == MAX_TOOL_ROUNDS;
        let mut req = ChatRequest::new(model.to_string(), system.to_string(), messages.clone());
        req.tools = if forced_final { Vec::new() } else { tools.clone() };
        req.tool_choice = if forced_final { ToolChoice::None } else { ToolChoice::Auto };

        let (round_text, pending_calls, round_usage) = run_stream_round(provider, &req, sink, retry).await?;

        total_usage.tokens_in += round_usage.tokens_in;
        total_usage.tokens_out += round_usage.tokens_out;
        final_text.push_str(&round_text);

        if pending_calls.is_empty() {
            if !round_text.is_empty() {
                messages.push(Message::assistant(round_text));
            }
            return Ok(MainStageOutput { messages, final_text, usage: total_usage, skill_outcomes });
        }

        if skill_ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        info!(round, calls = pending_calls.len(), "main stage dispatching tool calls");
        messages.push(Message::assistant_with_tool_calls(round_text, pending_calls.clone()));

        let outcomes = dispatcher.dispatch_all(&pending_calls, skill_ctx).await;
        for outcome in outcomes {
            messages.push(Message::tool_result(outcome.call.call_id.clone(), outcome.result.content.clone()));
            skill_outcomes.push(outcome);
        }
    }

    warn!("main stage exhausted tool rounds without a forced-final call producing text");
    Err(PipelineError::ToolRoundsExhausted(MAX_TOOL_ROUNDS))
}

/// Run one streaming round with the §7 timeout/retry policy applied to the
/// whole round (stream-open through End), not just the initial request — a
/// stalled stream and a stalled connect attempt both need to trip the same
/// budget. Each retry opens a fresh channel, since the previous round's
/// receiver may already have partial, now-discarded text in flight.
async fn run_stream_round(provider: &dyn LlmProvider, req: &ChatRequest, sink: &dyn BlockSink, retry: RetryPolicy) -> Result<(String, Vec<ToolCall>, Usage)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let (tx, rx) = mpsc::channel(64);
        let round = tokio::time::timeout(retry.timeout, async { tokio::join!(provider.chat_stream(req, tx), consume_stream(rx, sink)) }).await;

        let (stream_result, consumed) = match round {
            Ok((stream_result, consumed)) => (stream_result, Some(consumed)),
            Err(_) => (Err(ProviderError::Timeout(retry.timeout.as_secs())), None),
        };

        match stream_result {
            Ok(()) => return Ok(consumed.expect("stream succeeded so consume_stream ran to completion")),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = Duration::from_secs((1u64 << (attempt - 1)).min(retry.backoff_cap_secs));
                warn!(provider = provider.name(), attempt, error = %e, "main stream stalled or failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn consume_stream(mut rx: mpsc::Receiver<StreamEvent>, sink: &dyn BlockSink) -> (String, Vec<ToolCall>, Usage) {
    let mut aggregator = StreamAggregator::new();
    let mut pending_calls = Vec::new();
    let mut usage = Usage::default();
    let mut text = String::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta(delta) => {
                text.push_str(&delta);
                for block in aggregator.feed(&delta) {
                    sink.send_block(&block).await;
                }
            }
            StreamEvent::ToolCallFinal(call) => pending_calls.push(call),
            StreamEvent::ToolCallDelta { .. } => {}
            StreamEvent::Usage { tokens_in, tokens_out } => {
                usage.tokens_in += tokens_in;
                usage.tokens_out += tokens_out;
            }
            StreamEvent::Error(msg) => warn!(error = %msg, "provider stream reported an error event"),
            StreamEvent::End => break,
        }
    }

    if let Some(block) = aggregator.finish() {
        sink.send_block(&block).await;
    }

    (text, pending_calls, usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use openmates_providers::UnifiedResponse;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct RecordingSink(Mutex<Vec<String>>);
    #[async_trait]
    impl BlockSink for RecordingSink {
        async fn send_block(&self, block: &Block) {
            self.0.lock().unwrap().push(block.text().to_string());
        }
    }

    struct StubProvider {
        text: String,
        calls: Vec<ToolCall>,
    }
    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
            Ok(UnifiedResponse::ok(self.text.clone(), "stub-model".into(), Usage::default(), "stop".into(), self.calls.clone()))
        }
    }

    fn test_skill_ctx() -> SkillContext {
        use openmates_core::config::TransitConfig;
        use openmates_core::types::{ChatId, TaskId, UserId};
        SkillContext {
            task_id: TaskId::new(),
            user_id: UserId::new(),
            chat_id: ChatId::new(),
            secrets: Arc::new(openmates_transit::TransitClient::new(&TransitConfig::default())),
            cancel: CancellationToken::new(),
        }
    }

    fn empty_dispatcher() -> Dispatcher {
        use std::collections::HashMap;
        use std::time::Duration;
        Dispatcher::new(
            Arc::new(openmates_skills::SkillRegistry::default()),
            HashMap::new(),
            Arc::new(openmates_skills::InMemoryJobQueue::new(|_job| async { openmates_skills::SkillResult::error("unused") })),
            4,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn terminates_naturally_with_no_pending_calls() {
        let provider = StubProvider { text: "hello world".to_string(), calls: Vec::new() };
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let dispatcher = empty_dispatcher();
        let ctx = test_skill_ctx();

        let retry = RetryPolicy::new(5, 1, 1);
        let out = run_main_stage(&provider, "stub-model", "system", vec![Message::user("hi")], Vec::new(), &dispatcher, &ctx, &sink, retry)
            .await
            .unwrap();

        assert_eq!(out.final_text, "hello world");
        assert!(out.messages.last().unwrap().content.contains("hello world"));
    }

    struct StallsOnceThenStreams {
        attempts: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for StallsOnceThenStreams {
        fn name(&self) -> &str {
            "stalls-once-then-streams"
        }
        async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
            unreachable!("this stub only exercises chat_stream")
        }
        async fn chat_stream(&self, _req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> openmates_providers::Result<()> {
            if self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }
            let _ = tx.send(StreamEvent::TextDelta("hi".to_string())).await;
            let _ = tx.send(StreamEvent::End).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_stalled_stream_retries_and_completes_within_the_retry_budget() {
        let provider = StallsOnceThenStreams { attempts: std::sync::atomic::AtomicU32::new(0) };
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let dispatcher = empty_dispatcher();
        let ctx = test_skill_ctx();
        let retry = RetryPolicy::new(5, 2, 1);

        let out = run_main_stage(&provider, "stub-model", "system", vec![Message::user("hi")], Vec::new(), &dispatcher, &ctx, &sink, retry)
            .await
            .unwrap();

        assert_eq!(out.final_text, "hi");
    }
}
