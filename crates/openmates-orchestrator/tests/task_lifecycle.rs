//! End-to-end coverage of the nine-step task procedure, one test per scenario
//! named in SPEC_FULL.md §8. Exercises `Orchestrator::run_task` against a real
//! `InMemoryStore`, a mock Vault (`wiremock`) standing in for the transit
//! service, and stub providers shaped to each scenario's wire behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use openmates_core::config::TransitConfig;
use openmates_core::types::{ChatId, MessageId, ModelTier, TaskId, ToolCall, UserId};
use openmates_orchestrator::{Chat, InMemoryStore, MessageRepo, ModelSelection, Orchestrator, OrchestratorConfig, OrchestratorError, TaskInput};
use openmates_pipeline::context::MemoryCategoryInfo;
use openmates_pipeline::main_stage::BlockSink;
use openmates_pipeline::PipelineError;
use openmates_providers::{ChatRequest, LlmProvider, ProviderRegistry, StreamEvent, ToolDefinition, UnifiedResponse, Usage};
use openmates_skills::{Dispatcher, InMemoryJobQueue, SkillRegistry};
use openmates_transit::TransitClient;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct EchoEncrypt;
impl Respond for EchoEncrypt {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let plaintext_b64 = body.get("plaintext").and_then(|v| v.as_str()).unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {"ciphertext": format!("vault:{plaintext_b64}")}}))
    }
}

struct EchoDecrypt;
impl Respond for EchoDecrypt {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let ciphertext = body.get("ciphertext").and_then(|v| v.as_str()).unwrap_or_default();
        let plaintext_b64 = ciphertext.strip_prefix("vault:").unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {"plaintext": plaintext_b64}}))
    }
}

async fn mock_vault() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path_regex(r"^/v1/transit/encrypt/.*$")).respond_with(EchoEncrypt).mount(&server).await;
    Mock::given(method("POST")).and(path_regex(r"^/v1/transit/decrypt/.*$")).respond_with(EchoDecrypt).mount(&server).await;
    server
}

struct NoopSink;
#[async_trait]
impl BlockSink for NoopSink {
    async fn send_block(&self, _block: &openmates_aggregator::Block) {}
}

struct RecordingSink(std::sync::Mutex<Vec<String>>);
#[async_trait]
impl BlockSink for RecordingSink {
    async fn send_block(&self, block: &openmates_aggregator::Block) {
        self.0.lock().unwrap().push(block.text().to_string());
    }
}

/// A provider whose non-streaming `chat` always returns the given tool-call
/// free-form text; `chat_stream` falls back to the trait's default (one
/// `TextDelta` synthesized from `chat`'s result), covering preprocess/postprocess
/// stubs and any main-stage scenario that doesn't need a custom stream.
struct TextProvider {
    text: String,
}
#[async_trait]
impl LlmProvider for TextProvider {
    fn name(&self) -> &str {
        "text-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        Ok(UnifiedResponse::ok(self.text.clone(), "stub-model".into(), Usage::default(), "stop".into(), Vec::new()))
    }
}

/// Returns a fixed tool call from its non-streaming `chat`; used to drive
/// preprocess/postprocess forced-tool responses.
struct ToolCallProvider {
    call: ToolCall,
}
#[async_trait]
impl LlmProvider for ToolCallProvider {
    fn name(&self) -> &str {
        "tool-call-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        Ok(UnifiedResponse::ok(String::new(), "stub-model".into(), Usage::default(), "tool_calls".into(), vec![self.call.clone()]))
    }
}

fn preprocess_tool_call(action: &str, tier: &str) -> ToolCall {
    ToolCall::finalize("pre-1".into(), "classify".into(), format!(r#"{{"action":"{action}","model_selector":"{tier}"}}"#))
}

fn postprocess_phase1_call(follow_ups: usize, new_chats: usize, categories: &[&str]) -> ToolCall {
    let follow_up_list: Vec<String> = (0..follow_ups).map(|i| format!("follow up {i}")).collect();
    let new_chat_list: Vec<String> = (0..new_chats).map(|i| format!("new chat {i}")).collect();
    let args = serde_json::json!({
        "follow_up_request_suggestions": follow_up_list,
        "new_chat_request_suggestions": new_chat_list,
        "harmful_response": 0,
        "top_recommended_apps_for_user": [],
        "chat_summary": "a short summary",
        "relevant_settings_memory_categories": categories,
    });
    ToolCall::finalize("post-1".into(), "postprocess_response_tool".into(), args.to_string())
}

fn base_config() -> OrchestratorConfig {
    let mut main_models = HashMap::new();
    main_models.insert(ModelTier::Fast, ModelSelection { provider_id: "main".to_string(), model: "main-model".to_string() });
    main_models.insert(ModelTier::Balanced, ModelSelection { provider_id: "main".to_string(), model: "main-model".to_string() });

    OrchestratorConfig {
        preprocess: ModelSelection { provider_id: "pre".to_string(), model: "pre-model".to_string() },
        preprocess_tool: ToolDefinition { name: "classify".to_string(), description: String::new(), input_schema: serde_json::json!({"type":"object"}) },
        preprocess_cost: 1,
        postprocess: ModelSelection { provider_id: "post".to_string(), model: "post-model".to_string() },
        postprocess_phase1_tool: ToolDefinition { name: "postprocess_response_tool".to_string(), description: String::new(), input_schema: serde_json::json!({"type":"object"}) },
        postprocess_phase2_tool: ToolDefinition { name: "generate_settings_memories_tool".to_string(), description: String::new(), input_schema: serde_json::json!({"type":"object"}) },
        postprocess_cost: 1,
        main_models,
        main_floor_cost: 1,
        main_input_rate_per_1k: 1,
        main_output_rate_per_1k: 1,
        history_limit: 50,
        history_token_budget: 120_000,
        creator_key_id: "creator-key".to_string(),
        preprocess_timeout_secs: 5,
        main_stream_timeout_secs: 5,
        postprocess_timeout_secs: 5,
        transient_max_attempts: 2,
        transient_backoff_cap_secs: 1,
        task_wall_clock_secs: 30,
    }
}

async fn transit_client(vault: &MockServer) -> Arc<TransitClient> {
    let config = TransitConfig { vault_url: vault.uri(), vault_token: Some("test-token".to_string()), token_file_paths: Vec::new(), ..TransitConfig::default() };
    Arc::new(TransitClient::new(&config))
}

fn new_orchestrator(providers: ProviderRegistry, store: Arc<InMemoryStore>, transit: Arc<TransitClient>, config: OrchestratorConfig) -> Orchestrator {
    let registry = Arc::new(SkillRegistry::default());
    let queue = Arc::new(InMemoryJobQueue::new(|_job| async { openmates_skills::SkillResult::error("unused") }));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), HashMap::new(), queue, 4, Duration::from_secs(5)));
    Orchestrator::new(providers, store.clone(), store.clone(), store.clone(), store, transit, dispatcher, registry, config)
}

fn seed_chat(store: &InMemoryStore, chat_id: &ChatId, user_id: &UserId, balance: i64) {
    store.seed_chat(Chat { chat_id: chat_id.clone(), user_id: user_id.clone(), messages_v: 0, vault_key_id: "vk".into(), language: "en".into() }, balance);
}

fn task_input(task_id: TaskId, user_id: UserId, chat_id: ChatId, turn: &str, incognito: bool, categories: Vec<MemoryCategoryInfo>) -> TaskInput {
    TaskInput {
        task_id,
        user_id,
        chat_id,
        message_id: MessageId::new(),
        plaintext_turn: turn.to_string(),
        is_incognito: incognito,
        available_apps: Vec::new(),
        available_memory_categories: categories,
    }
}

#[tokio::test]
async fn happy_chat_streams_one_block_and_persists_one_message() {
    let vault = mock_vault().await;
    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(ToolCallProvider { call: preprocess_tool_call("none", "fast") }));
    providers.register("main", Arc::new(TextProvider { text: "Hi! How can I help?".to_string() }));
    providers.register("post", Arc::new(ToolCallProvider { call: postprocess_phase1_call(6, 6, &[]) }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;
    let orchestrator = new_orchestrator(providers, store.clone(), transit, base_config());

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 1000);

    let input = task_input(TaskId::new(), user_id, chat_id.clone(), "hello", false, Vec::new());
    let sink = RecordingSink(std::sync::Mutex::new(Vec::new()));
    let outcome = orchestrator.run_task(input, &sink).await.unwrap();

    assert_eq!(outcome.final_text, "Hi! How can I help?");
    assert_eq!(outcome.follow_up_suggestions.len(), 6);
    assert_eq!(outcome.new_chat_suggestions.len(), 6);
    assert_eq!(sink.0.lock().unwrap().len(), 1);

    let persisted = MessageRepo::get_recent_messages(&*store, &chat_id, 10).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].content, "Hi! How can I help?");
}

/// A main-stage provider that emits a tool call on its first stream and a
/// two-paragraph answer on its second (the round after the skill result comes
/// back), matching SPEC_FULL.md §8 scenario 2's "exactly 2 delta events".
struct ToolRoundProvider {
    attempts: AtomicU32,
}
#[async_trait]
impl LlmProvider for ToolRoundProvider {
    fn name(&self) -> &str {
        "tool-round-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        unreachable!("this stub only exercises chat_stream")
    }
    async fn chat_stream(&self, _req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> openmates_providers::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let call = ToolCall::finalize("call-1".into(), "code.get_docs".into(), r#"{"library":"/sveltejs/svelte","question":"what is a rune?"}"#.into());
            let _ = tx.send(StreamEvent::ToolCallFinal(call)).await;
        } else {
            let _ = tx.send(StreamEvent::TextDelta("Paragraph one.\n\nParagraph two.".to_string())).await;
        }
        let _ = tx.send(StreamEvent::End).await;
        Ok(())
    }
}

fn write_get_docs_manifest(dir: &std::path::Path) {
    let skill_dir = dir.join("code").join("skills").join("get_docs");
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(
        skill_dir.join("manifest.yml"),
        br#"
description: "fetch library docs"
stage: prod
execution_mode: inline
tool_schema:
  type: object
  properties:
    library: { type: string }
    question: { type: string }
  required: ["library", "question"]
pricing:
  base: 3.0
  per_unit: 0.0
"#,
    )
    .unwrap();
}

struct GetDocsSkill;
#[async_trait]
impl openmates_skills::Skill for GetDocsSkill {
    async fn execute(&self, _args: serde_json::Value, _ctx: openmates_skills::SkillContext) -> openmates_skills::SkillResult {
        openmates_skills::SkillResult::success("a rune is a compiler hint")
    }
}

#[tokio::test]
async fn tool_round_then_answer_streams_exactly_two_blocks() {
    let vault = mock_vault().await;
    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(ToolCallProvider { call: preprocess_tool_call("code.get_docs", "balanced") }));
    providers.register("main", Arc::new(ToolRoundProvider { attempts: AtomicU32::new(0) }));
    providers.register("post", Arc::new(ToolCallProvider { call: postprocess_phase1_call(0, 0, &[]) }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;

    let tmp = std::env::temp_dir().join(format!("openmates-orchestrator-e2e-{}", uuid::Uuid::new_v4()));
    write_get_docs_manifest(&tmp);
    let registry = Arc::new(SkillRegistry::load_from_root(&tmp).unwrap());
    let mut inline: HashMap<(String, String), Arc<dyn openmates_skills::Skill>> = HashMap::new();
    inline.insert(("code".to_string(), "get_docs".to_string()), Arc::new(GetDocsSkill));
    let queue = Arc::new(InMemoryJobQueue::new(|_job| async { openmates_skills::SkillResult::error("unused") }));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), inline, queue, 4, Duration::from_secs(5)));

    let orchestrator = Orchestrator::new(providers, store.clone(), store.clone(), store.clone(), store.clone(), transit, dispatcher, registry, base_config());

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 1000);

    let input = task_input(TaskId::new(), user_id.clone(), chat_id, "tell me about runes", false, Vec::new());
    let sink = RecordingSink(std::sync::Mutex::new(Vec::new()));
    let outcome = orchestrator.run_task(input, &sink).await.unwrap();

    assert_eq!(outcome.final_text, "Paragraph one.\n\nParagraph two.");
    assert_eq!(sink.0.lock().unwrap().len(), 2);

    let usage_rows = store.usage_entries_for(&user_id);
    assert_eq!(usage_rows.len(), 1, "exactly one skill invocation should have produced a usage row");

    std::fs::remove_dir_all(&tmp).ok();
}

#[tokio::test]
async fn insufficient_credits_rejects_before_main_runs() {
    let vault = mock_vault().await;
    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(ToolCallProvider { call: preprocess_tool_call("none", "fast") }));
    providers.register("main", Arc::new(TextProvider { text: "unused".to_string() }));
    providers.register("post", Arc::new(ToolCallProvider { call: postprocess_phase1_call(0, 0, &[]) }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;
    let orchestrator = new_orchestrator(providers, store.clone(), transit, base_config());

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 0);

    let input = task_input(TaskId::new(), user_id, chat_id.clone(), "hello", false, Vec::new());
    let sink = NoopSink;
    let err = orchestrator.run_task(input, &sink).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InsufficientCredits { .. }));

    let persisted = MessageRepo::get_recent_messages(&*store, &chat_id, 10).await.unwrap();
    assert!(persisted.is_empty());
}

/// Stalls its first stream for longer than the retry policy's per-attempt
/// timeout, then streams normally on the retried attempt.
struct StallsOnceProvider {
    attempts: AtomicU32,
}
#[async_trait]
impl LlmProvider for StallsOnceProvider {
    fn name(&self) -> &str {
        "stalls-once-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        unreachable!("this stub only exercises chat_stream")
    }
    async fn chat_stream(&self, _req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> openmates_providers::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(180)).await;
            return Ok(());
        }
        let _ = tx.send(StreamEvent::TextDelta("recovered after retry".to_string())).await;
        let _ = tx.send(StreamEvent::End).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn a_stalled_main_stream_retries_and_still_completes_within_the_wall_clock_budget() {
    let vault = mock_vault().await;
    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(ToolCallProvider { call: preprocess_tool_call("none", "fast") }));
    providers.register("main", Arc::new(StallsOnceProvider { attempts: AtomicU32::new(0) }));
    providers.register("post", Arc::new(ToolCallProvider { call: postprocess_phase1_call(0, 0, &[]) }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;

    let mut config = base_config();
    config.main_stream_timeout_secs = 90;
    config.task_wall_clock_secs = 360;
    let orchestrator = new_orchestrator(providers, store.clone(), transit, config);

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 1000);

    let input = task_input(TaskId::new(), user_id, chat_id, "hello", false, Vec::new());
    let sink = NoopSink;

    let start = tokio::time::Instant::now();
    let outcome = orchestrator.run_task(input, &sink).await.unwrap();
    assert_eq!(outcome.final_text, "recovered after retry");
    assert!(start.elapsed() <= Duration::from_secs(360));
}

/// Holds the task open at the preprocess step (after `TaskRegistry::begin` has
/// already run) until the test driver can cancel it from outside, then lets
/// the main stage produce a pending tool call — the only point the current
/// tool loop checks the cancel signal.
struct CancelGateProvider {
    ready: Arc<Notify>,
    go: Arc<Notify>,
}
#[async_trait]
impl LlmProvider for CancelGateProvider {
    fn name(&self) -> &str {
        "cancel-gate-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        self.ready.notify_one();
        self.go.notified().await;
        Ok(UnifiedResponse::ok(String::new(), "stub-model".into(), Usage::default(), "tool_calls".into(), vec![preprocess_tool_call("demo.wait", "fast")]))
    }
}

struct PendingToolCallProvider;
#[async_trait]
impl LlmProvider for PendingToolCallProvider {
    fn name(&self) -> &str {
        "pending-tool-call-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        let call = ToolCall::finalize("call-1".into(), "demo.wait".into(), "{}".into());
        Ok(UnifiedResponse::ok(String::new(), "stub-model".into(), Usage::default(), "tool_calls".into(), vec![call]))
    }
}

#[tokio::test]
async fn cancellation_before_the_tool_round_check_aborts_the_task_and_refunds_credits() {
    let vault = mock_vault().await;
    let ready = Arc::new(Notify::new());
    let go = Arc::new(Notify::new());

    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(CancelGateProvider { ready: ready.clone(), go: go.clone() }));
    providers.register("main", Arc::new(PendingToolCallProvider));
    providers.register("post", Arc::new(ToolCallProvider { call: postprocess_phase1_call(0, 0, &[]) }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;
    let orchestrator = Arc::new(new_orchestrator(providers, store.clone(), transit, base_config()));

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 1000);

    let task_id = TaskId::new();
    let input = task_input(task_id.clone(), user_id.clone(), chat_id.clone(), "hello", false, Vec::new());

    let run_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task(input, &NoopSink).await })
    };

    ready.notified().await;
    assert!(orchestrator.cancel_task(&task_id), "task should already be registered by the time preprocess starts");
    go.notify_one();

    let err = run_handle.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::Pipeline(PipelineError::Cancelled)));

    let persisted = MessageRepo::get_recent_messages(&*store, &chat_id, 10).await.unwrap();
    assert!(persisted.is_empty(), "a cancelled task must never persist an assistant message");

    let balance = store.usage_entries_for(&user_id);
    assert!(balance.is_empty(), "a cancelled task must never record skill usage");
}

/// Phase 1 succeeds with a category selected; Phase 2 (same provider,
/// second invocation) errors, so suggested memories should come back empty
/// without failing the whole task.
struct PhaseFailingPostProvider {
    attempts: AtomicU32,
    phase1_call: ToolCall,
}
#[async_trait]
impl LlmProvider for PhaseFailingPostProvider {
    fn name(&self) -> &str {
        "phase-failing-post-provider"
    }
    async fn chat(&self, _req: &ChatRequest) -> openmates_providers::Result<UnifiedResponse> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(UnifiedResponse::ok(String::new(), "stub-model".into(), Usage::default(), "tool_calls".into(), vec![self.phase1_call.clone()]))
        } else {
            Ok(UnifiedResponse::err("phase 2 provider failure"))
        }
    }
}

#[tokio::test]
async fn postprocess_phase2_failure_still_completes_the_task_with_empty_memories() {
    let vault = mock_vault().await;
    let phase1_call = postprocess_phase1_call(2, 1, &["code.preferred_tech"]);

    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(ToolCallProvider { call: preprocess_tool_call("none", "fast") }));
    providers.register("main", Arc::new(TextProvider { text: "all set".to_string() }));
    providers.register("post", Arc::new(PhaseFailingPostProvider { attempts: AtomicU32::new(0), phase1_call }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;
    let orchestrator = new_orchestrator(providers, store.clone(), transit, base_config());

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 1000);

    let categories = vec![MemoryCategoryInfo { id: "code.preferred_tech".to_string(), description: "preferred languages/frameworks".to_string() }];
    let input = task_input(TaskId::new(), user_id, chat_id, "hello", false, categories);
    let sink = NoopSink;

    let outcome = orchestrator.run_task(input, &sink).await.unwrap();
    assert_eq!(outcome.final_text, "all set");
    assert_eq!(outcome.follow_up_suggestions.len(), 2);
    assert_eq!(outcome.new_chat_suggestions.len(), 1);
    assert!(outcome.suggested_memories.is_empty());
}

#[tokio::test]
async fn incognito_tasks_skip_postprocess_entirely() {
    let vault = mock_vault().await;
    let mut providers = ProviderRegistry::new();
    providers.register("pre", Arc::new(ToolCallProvider { call: preprocess_tool_call("none", "fast") }));
    providers.register("main", Arc::new(TextProvider { text: "hi".to_string() }));
    providers.register("post", Arc::new(ToolCallProvider { call: postprocess_phase1_call(6, 6, &[]) }));

    let store = Arc::new(InMemoryStore::new());
    let transit = transit_client(&vault).await;
    let orchestrator = new_orchestrator(providers, store.clone(), transit, base_config());

    let user_id = UserId::new();
    let chat_id = ChatId::new();
    seed_chat(&store, &chat_id, &user_id, 1000);

    let input = task_input(TaskId::new(), user_id, chat_id, "hello", true, Vec::new());
    let sink = NoopSink;
    let outcome = orchestrator.run_task(input, &sink).await.unwrap();

    assert!(outcome.follow_up_suggestions.is_empty());
    assert!(outcome.new_chat_suggestions.is_empty());
    assert!(outcome.suggested_memories.is_empty());
}
