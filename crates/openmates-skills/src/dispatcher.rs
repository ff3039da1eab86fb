//! Resolves tool calls from the main stage to manifests and executes them
//! (SPEC_FULL.md §4.E). Grounded on `skynet-agent/src/tools/tool_loop.rs`'s
//! per-call execution loop and `mod.rs`'s `Tool`/`ToolResult` shape, generalized
//! to a richer `SkillResult` (embeds, credit overrides) and to the inline vs.
//! queued split §4.E calls for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openmates_core::types::{ChatId, TaskId, ToolCall, UserId};
use openmates_transit::TransitClient;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SkillError;
use crate::job_queue::{JobQueue, QueuedJob};
use crate::manifest::SkillRegistry;

/// An auxiliary artifact a skill wants persisted. The orchestrator turns this
/// into a full `Embed` record through the record-store interface — skills
/// never talk to the record store directly (SPEC_FULL.md §4.H step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEmbed {
    pub embed_type: String,
    pub encrypted_content: String,
    pub encrypted_type: String,
}

/// `ctx` per SPEC_FULL.md §4.E: identifiers, the secrets client, a cancel
/// signal. Record-store access is intentionally absent — see `SkillEmbed`.
#[derive(Clone)]
pub struct SkillContext {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub secrets: Arc<TransitClient>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillResult {
    pub content: String,
    #[serde(default)]
    pub embeds: Vec<SkillEmbed>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub credits_override: Option<f64>,
}

impl SkillResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self { content: content.into(), embeds: Vec::new(), error: None, credits_override: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self { content: message.clone(), embeds: Vec::new(), error: Some(message), credits_override: None }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait Skill: Send + Sync {
    async fn execute(&self, args: serde_json::Value, ctx: SkillContext) -> SkillResult;
}

/// One tool call paired with the credits it cost and the result to hand back
/// to the main stage. Order matches the order tool calls were issued in
/// (SPEC_FULL.md §8 "Tool-call ordering").
pub struct DispatchOutcome {
    pub call: ToolCall,
    pub result: SkillResult,
    pub credits: f64,
}

pub struct Dispatcher {
    registry: Arc<SkillRegistry>,
    inline_skills: HashMap<(String, String), Arc<dyn Skill>>,
    queue: Arc<dyn JobQueue>,
    inline_semaphore: Arc<Semaphore>,
    queued_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SkillRegistry>,
        inline_skills: HashMap<(String, String), Arc<dyn Skill>>,
        queue: Arc<dyn JobQueue>,
        inline_concurrency: usize,
        queued_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            inline_skills,
            queue,
            inline_semaphore: Arc::new(Semaphore::new(inline_concurrency.max(1))),
            queued_deadline,
        }
    }

    /// Dispatch every tool call in `calls` concurrently (bounded by the inline
    /// concurrency cap), preserving the original call order in the returned
    /// vector regardless of completion order.
    pub async fn dispatch_all(&self, calls: &[ToolCall], ctx: &SkillContext) -> Vec<DispatchOutcome> {
        let futures = calls.iter().map(|call| self.dispatch_one(call, ctx.clone()));
        futures_util::future::join_all(futures).await
    }

    async fn dispatch_one(&self, call: &ToolCall, ctx: SkillContext) -> DispatchOutcome {
        let Some((app_id, skill_id)) = split_qualified_name(&call.function_name) else {
            return DispatchOutcome {
                call: call.clone(),
                result: SkillResult::error(format!("malformed tool name: {}", call.function_name)),
                credits: 0.0,
            };
        };

        let Some(manifest) = self.registry.get(&app_id, &skill_id) else {
            let err = SkillError::UnknownSkill { app_id, skill_id };
            return DispatchOutcome { call: call.clone(), result: SkillResult::error(err.to_string()), credits: 0.0 };
        };

        let args = match &call.arguments_parsed {
            Some(v) => v.clone(),
            None => {
                let msg = call.parse_error.clone().unwrap_or_else(|| "arguments were not valid JSON".to_string());
                return DispatchOutcome { call: call.clone(), result: SkillResult::error(msg), credits: 0.0 };
            }
        };

        if let Err(e) = SkillRegistry::validate_args(manifest, &args) {
            return DispatchOutcome { call: call.clone(), result: SkillResult::error(e.to_string()), credits: 0.0 };
        }

        let timeout = Duration::from_secs(manifest.timeout_secs.unwrap_or(60));

        let result = match manifest.execution_mode {
            openmates_core::types::ExecutionMode::Inline => self.dispatch_inline(&app_id, &skill_id, args, ctx, timeout).await,
            openmates_core::types::ExecutionMode::Queued => {
                let cancel = ctx.cancel.clone();
                self.dispatch_queued(ctx.task_id.clone(), &app_id, &skill_id, args, cancel).await
            }
        };

        let credits = if result.is_error() {
            0.0
        } else {
            result.credits_override.unwrap_or_else(|| manifest.pricing.cost(0.0))
        };

        DispatchOutcome { call: call.clone(), result, credits }
    }

    async fn dispatch_inline(&self, app_id: &str, skill_id: &str, args: serde_json::Value, ctx: SkillContext, timeout: Duration) -> SkillResult {
        let Some(skill) = self.inline_skills.get(&(app_id.to_string(), skill_id.to_string())) else {
            return SkillResult::error(format!("no inline implementation registered for {app_id}.{skill_id}"));
        };

        let _permit = match self.inline_semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return SkillResult::error("dispatcher shutting down"),
        };

        let skill = skill.clone();
        let cancel = ctx.cancel.clone();
        tokio::select! {
            outcome = tokio::time::timeout(timeout, skill.execute(args, ctx)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        let err = SkillError::Timeout { app_id: app_id.to_string(), skill_id: skill_id.to_string(), timeout_secs: timeout.as_secs() };
                        warn!(app_id, skill_id, "inline skill timed out");
                        SkillResult::error(err.to_string())
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!(app_id, skill_id, "inline skill cancelled");
                SkillResult::error(SkillError::Cancelled.to_string())
            }
        }
    }

    async fn dispatch_queued(&self, task_id: TaskId, app_id: &str, skill_id: &str, args: serde_json::Value, cancel: CancellationToken) -> SkillResult {
        let job = QueuedJob { task_id, app_id: app_id.to_string(), skill_id: skill_id.to_string(), args };
        let correlation_id = match self.queue.enqueue(job).await {
            Ok(id) => id,
            Err(e) => return SkillResult::error(e.to_string()),
        };
        tokio::select! {
            result = self.queue.await_result(&correlation_id, self.queued_deadline) => {
                match result {
                    Ok(result) => result,
                    Err(e) => SkillResult::error(e.to_string()),
                }
            }
            _ = cancel.cancelled() => {
                info!(app_id, skill_id, "queued skill cancelled");
                SkillResult::error(SkillError::Cancelled.to_string())
            }
        }
    }
}

fn split_qualified_name(name: &str) -> Option<(String, String)> {
    let (app_id, skill_id) = name.split_once('.')?;
    Some((app_id.to_string(), skill_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_queue::InMemoryJobQueue;
    use openmates_core::config::TransitConfig;
    use std::io::Write;
    use std::path::Path;

    struct EchoSkill;

    #[async_trait]
    impl Skill for EchoSkill {
        async fn execute(&self, args: serde_json::Value, _ctx: SkillContext) -> SkillResult {
            SkillResult::success(format!("echo:{args}"))
        }
    }

    fn write_manifest(dir: &Path, app_id: &str, skill_id: &str) {
        let skill_dir = dir.join(app_id).join("skills").join(skill_id);
        std::fs::create_dir_all(&skill_dir).unwrap();
        let mut f = std::fs::File::create(skill_dir.join("manifest.yml")).unwrap();
        f.write_all(
            br#"
description: "test skill"
stage: prod
execution_mode: inline
tool_schema:
  type: object
  properties:
    x: { type: string }
  required: ["x"]
pricing:
  base: 2.0
  per_unit: 0.0
"#,
        )
        .unwrap();
    }

    fn test_ctx() -> SkillContext {
        SkillContext {
            task_id: TaskId::new(),
            user_id: UserId::new(),
            chat_id: ChatId::new(),
            secrets: Arc::new(TransitClient::new(&TransitConfig::default())),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn dispatches_an_inline_skill_and_preserves_call_order() {
        let tmp = std::env::temp_dir().join(format!("openmates-dispatch-test-{}", uuid::Uuid::new_v4()));
        write_manifest(&tmp, "demo", "echo");
        let registry = Arc::new(SkillRegistry::load_from_root(&tmp).unwrap());

        let mut inline: HashMap<(String, String), Arc<dyn Skill>> = HashMap::new();
        inline.insert(("demo".to_string(), "echo".to_string()), Arc::new(EchoSkill));

        let queue = Arc::new(InMemoryJobQueue::new(|_job| async { SkillResult::error("unused") }));
        let dispatcher = Dispatcher::new(registry, inline, queue, 4, Duration::from_secs(5));

        let calls = vec![
            ToolCall::finalize("1".into(), "demo.echo".into(), r#"{"x":"a"}"#.into()),
            ToolCall::finalize("2".into(), "demo.echo".into(), r#"{"x":"b"}"#.into()),
        ];
        let outcomes = dispatcher.dispatch_all(&calls, &test_ctx()).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].call.call_id, "1");
        assert_eq!(outcomes[1].call.call_id, "2");
        assert!(outcomes[0].result.content.contains("\"a\""));
        assert_eq!(outcomes[0].credits, 2.0);

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[tokio::test]
    async fn invalid_args_never_charges_credits() {
        let tmp = std::env::temp_dir().join(format!("openmates-dispatch-test-{}", uuid::Uuid::new_v4()));
        write_manifest(&tmp, "demo", "echo");
        let registry = Arc::new(SkillRegistry::load_from_root(&tmp).unwrap());

        let mut inline: HashMap<(String, String), Arc<dyn Skill>> = HashMap::new();
        inline.insert(("demo".to_string(), "echo".to_string()), Arc::new(EchoSkill));
        let queue = Arc::new(InMemoryJobQueue::new(|_job| async { SkillResult::error("unused") }));
        let dispatcher = Dispatcher::new(registry, inline, queue, 4, Duration::from_secs(5));

        let calls = vec![ToolCall::finalize("1".into(), "demo.echo".into(), r#"{}"#.into())];
        let outcomes = dispatcher.dispatch_all(&calls, &test_ctx()).await;

        assert!(outcomes[0].result.is_error());
        assert_eq!(outcomes[0].credits, 0.0);

        std::fs::remove_dir_all(&tmp).ok();
    }

    fn write_queued_manifest(dir: &Path, app_id: &str, skill_id: &str) {
        let skill_dir = dir.join(app_id).join("skills").join(skill_id);
        std::fs::create_dir_all(&skill_dir).unwrap();
        let mut f = std::fs::File::create(skill_dir.join("manifest.yml")).unwrap();
        f.write_all(
            br#"
description: "test skill"
stage: prod
execution_mode: queued
tool_schema:
  type: object
  properties: {}
pricing:
  base: 1.0
  per_unit: 0.0
"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn cancelling_a_queued_skill_returns_within_the_cancel_signal_not_the_deadline() {
        let tmp = std::env::temp_dir().join(format!("openmates-dispatch-test-{}", uuid::Uuid::new_v4()));
        write_queued_manifest(&tmp, "demo", "slow");
        let registry = Arc::new(SkillRegistry::load_from_root(&tmp).unwrap());

        // A worker that never resolves: only the cancel signal can end the dispatch.
        let queue = Arc::new(InMemoryJobQueue::new(|_job| async {
            std::future::pending::<()>().await;
            unreachable!()
        }));
        let dispatcher = Dispatcher::new(registry, HashMap::new(), queue, 4, Duration::from_secs(300));

        let ctx = test_ctx();
        let cancel = ctx.cancel.clone();
        let calls = vec![ToolCall::finalize("1".into(), "demo.slow".into(), "{}".into())];

        let dispatch = dispatcher.dispatch_all(&calls, &ctx);
        tokio::pin!(dispatch);

        tokio::select! {
            _ = &mut dispatch => panic!("dispatch resolved before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        cancel.cancel();

        let outcomes = tokio::time::timeout(Duration::from_secs(5), dispatch).await.expect("cancellation should unblock dispatch well within the queue deadline");
        assert!(outcomes[0].result.is_error());

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[tokio::test]
    async fn unknown_skill_is_reported_without_a_panic() {
        let registry = Arc::new(SkillRegistry::default());
        let queue = Arc::new(InMemoryJobQueue::new(|_job| async { SkillResult::error("unused") }));
        let dispatcher = Dispatcher::new(registry, HashMap::new(), queue, 4, Duration::from_secs(5));

        let calls = vec![ToolCall::finalize("1".into(), "ghost.vanish".into(), "{}".into())];
        let outcomes = dispatcher.dispatch_all(&calls, &test_ctx()).await;
        assert!(outcomes[0].result.is_error());
    }
}
