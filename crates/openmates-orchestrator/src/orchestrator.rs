//! The per-turn 9-step procedure (SPEC_FULL.md §4.H). Wires
//! `openmates-pipeline`'s stages, `openmates-skills::Dispatcher`, the four
//! repository traits, and `openmates-ledger`'s usage/creator-income
//! construction into one state machine. Grounded on `skynet-gateway/src/app.rs`
//! for the active-task bookkeeping (delegated to `crate::task::TaskRegistry`)
//! and on SPEC_FULL.md §4.H's numbered procedure for everything else — there
//! is no single teacher file that does all of this, since the teacher has no
//! credit ledger or postprocess stage.

use std::collections::HashMap;
use std::sync::Arc;

use openmates_core::token_estimator::CharDivFourEstimator;
use openmates_core::types::{ChatId, Message, MessageId, ModelTier, TaskId, UserId};
use openmates_ledger::{build_usage_entry, reserve_creator_income, UsageEvent};
use openmates_pipeline::{
    context::{MemoryCategoryInfo, PostprocessContext, TaskContext},
    history::truncate_to_token_budget,
    main_stage::{run_main_stage, BlockSink},
    postprocess::{run_phase1, run_phase2, Phase1Output, SuggestedMemoryEntry},
    preprocess::run_preprocess,
    PipelineError,
};
use openmates_providers::{ProviderRegistry, RetryPolicy, ToolDefinition};
use openmates_skills::{Dispatcher, SkillContext, SkillRegistry};
use openmates_transit::TransitClient;
use tracing::{info, warn};

use crate::credit::{minimum_reservation, CreditBreakdown};
use crate::embed::new_root_embed;
use crate::error::{OrchestratorError, Result};
use crate::record_store::{ChatRepo, EmbedKeyWrapSource, EmbedRepo, MessageRepo, UsageRepo};
use crate::task::{TaskRegistry, TaskState};

pub struct TaskInput {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub plaintext_turn: String,
    pub is_incognito: bool,
    pub available_apps: Vec<String>,
    pub available_memory_categories: Vec<MemoryCategoryInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub final_text: String,
    pub follow_up_suggestions: Vec<String>,
    pub new_chat_suggestions: Vec<String>,
    pub suggested_memories: Vec<SuggestedMemoryEntry>,
}

#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub provider_id: String,
    pub model: String,
}

pub struct OrchestratorConfig {
    pub preprocess: ModelSelection,
    pub preprocess_tool: ToolDefinition,
    pub preprocess_cost: i64,
    pub postprocess: ModelSelection,
    pub postprocess_phase1_tool: ToolDefinition,
    pub postprocess_phase2_tool: ToolDefinition,
    pub postprocess_cost: i64,
    pub main_models: HashMap<ModelTier, ModelSelection>,
    pub main_floor_cost: i64,
    /// Credits per 1000 tokens, input and output.
    pub main_input_rate_per_1k: i64,
    pub main_output_rate_per_1k: i64,
    pub history_limit: usize,
    pub history_token_budget: usize,
    pub creator_key_id: String,
    pub preprocess_timeout_secs: u64,
    pub main_stream_timeout_secs: u64,
    pub postprocess_timeout_secs: u64,
    pub transient_max_attempts: u32,
    pub transient_backoff_cap_secs: u64,
    /// Wall-clock budget for one task, start to finish, across every stage and
    /// retry (SPEC_FULL.md §8 scenario 4: a stalled stream plus one retry must
    /// still land inside this). Exceeding it cancels the task.
    pub task_wall_clock_secs: u64,
}

impl OrchestratorConfig {
    fn retry_policy(&self, timeout_secs: u64) -> RetryPolicy {
        RetryPolicy::new(timeout_secs, self.transient_max_attempts, self.transient_backoff_cap_secs)
    }
}

pub struct Orchestrator {
    providers: ProviderRegistry,
    chats: Arc<dyn ChatRepo>,
    messages: Arc<dyn MessageRepo>,
    embeds: Arc<dyn EmbedRepo>,
    usage: Arc<dyn UsageRepo>,
    transit: Arc<TransitClient>,
    dispatcher: Arc<Dispatcher>,
    skill_registry: Arc<SkillRegistry>,
    tasks: TaskRegistry,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: ProviderRegistry,
        chats: Arc<dyn ChatRepo>,
        messages: Arc<dyn MessageRepo>,
        embeds: Arc<dyn EmbedRepo>,
        usage: Arc<dyn UsageRepo>,
        transit: Arc<TransitClient>,
        dispatcher: Arc<Dispatcher>,
        skill_registry: Arc<SkillRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { providers, chats, messages, embeds, usage, transit, dispatcher, skill_registry, tasks: TaskRegistry::new(), config }
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> bool {
        self.tasks.cancel(task_id)
    }

    pub async fn run_task(&self, input: TaskInput, sink: &dyn BlockSink) -> Result<TaskOutcome> {
        let cancel = self.tasks.begin(&input.task_id)?;
        let wall_clock = std::time::Duration::from_secs(self.config.task_wall_clock_secs);

        let outcome = match tokio::time::timeout(wall_clock, self.run_task_inner(&input, sink, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(OrchestratorError::TaskTimeout(self.config.task_wall_clock_secs))
            }
        };

        match outcome {
            Ok(outcome) => {
                self.tasks.transition(&input.task_id, TaskState::Done);
                self.tasks.finish(&input.task_id);
                Ok(outcome)
            }
            Err(e) => {
                self.tasks.transition(&input.task_id, if matches!(e, OrchestratorError::Cancelled) { TaskState::Cancelled } else { TaskState::Failed });
                self.tasks.finish(&input.task_id);
                Err(e)
            }
        }
    }

    async fn run_task_inner(&self, input: &TaskInput, sink: &dyn BlockSink, cancel: &tokio_util::sync::CancellationToken) -> Result<TaskOutcome> {
        // Step 1: load context.
        self.tasks.transition(&input.task_id, TaskState::Pre);
        let chat = self.chats.get_chat(&input.chat_id).await?;
        let encrypted_history = self.messages.get_recent_messages(&input.chat_id, self.config.history_limit).await?;
        let mut history = Vec::with_capacity(encrypted_history.len());
        for message in encrypted_history {
            let plaintext = self.transit.decrypt_with_user_key(&chat.vault_key_id, &message.content).await?;
            history.push(Message { content: plaintext, ..message });
        }

        // Step 2: history transformation — truncate to the configured token budget.
        let estimator = CharDivFourEstimator;
        let mut transformed = truncate_to_token_budget(&history, self.config.history_token_budget, &estimator);
        transformed.push(Message::user(input.plaintext_turn.clone()));

        // Step 3: Pre.
        let preprocess_provider = self
            .providers
            .get(&self.config.preprocess.provider_id)
            .ok_or_else(|| OrchestratorError::Pipeline(PipelineError::PreprocessFailed("preprocess provider not registered".to_string())))?;
        let preprocess_output = run_preprocess(
            preprocess_provider.as_ref(),
            &self.config.preprocess.model,
            self.config.preprocess_tool.clone(),
            &transformed,
            self.config.retry_policy(self.config.preprocess_timeout_secs),
        )
        .await?;

        // Step 4: pre-debit.
        let reserve_amount = minimum_reservation(self.config.preprocess_cost, self.config.main_floor_cost);
        let reservation = match self.chats.reserve_credits(&input.user_id, reserve_amount).await {
            Ok(r) => r,
            Err(_) => {
                let have = self.chats.get_credit_balance(&input.user_id).await.unwrap_or(0);
                return Err(OrchestratorError::InsufficientCredits { need: reserve_amount, have });
            }
        };

        // Step 5: Main.
        self.tasks.transition(&input.task_id, TaskState::MainStream);
        let main_result = self.run_main(input, &preprocess_output, transformed, sink, cancel).await;

        let main_output = match main_result {
            Ok(output) => output,
            Err(e) => {
                self.chats.refund_credits(&reservation).await.ok();
                return Err(e);
            }
        };

        // Persist the final assistant message atomically after END, never
        // partially (§4.H "Cancellation": "if cancel occurs before the final
        // END of the main stream, no assistant message is persisted"), and
        // only ever as ciphertext under the chat's vault key (§4.H step 1).
        let encrypted_final_text = self.transit.encrypt_with_user_key(&chat.vault_key_id, &main_output.final_text).await?;
        let assistant_message_id = MessageId::new();
        self.messages.append_message(&input.chat_id, &assistant_message_id, Message::assistant(encrypted_final_text)).await?;
        self.chats.increment_messages_v(&input.chat_id).await?;

        // Step 6: skill recording.
        let now = chrono_now_unix();
        let mut skills_total_credits: i64 = 0;
        for outcome in &main_output.skill_outcomes {
            skills_total_credits += outcome.credits.round() as i64;

            let event = UsageEvent {
                user_id: &input.user_id,
                user_vault_key_id: &chat.vault_key_id,
                app_id: outcome.call.function_name.split('.').next().unwrap_or_default(),
                skill_id: outcome.call.function_name.split('.').nth(1).unwrap_or_default(),
                usage_type: "skill",
                created_at: now,
                credits_charged: outcome.credits,
                model_used: None,
                chat_id: Some(&input.chat_id),
                message_id: Some(&assistant_message_id),
                actual_input_tokens: None,
                actual_output_tokens: None,
            };
            if let Ok(entry) = build_usage_entry(&self.transit, &event).await {
                self.usage.append_usage(entry).await?;
            } else {
                warn!("failed to encrypt a skill usage entry; skipping it rather than failing the task");
            }

            if outcome.credits > 0.0 && outcome.result.error.is_none() {
                let invocation_id = openmates_core::types::InvocationId::new();
                if let Ok(reservation) = reserve_creator_income(&self.transit, &self.config.creator_key_id, invocation_id.clone(), outcome.credits, now).await {
                    self.usage.append_creator_income(invocation_id.clone(), reservation).await?;

                    for embed in &outcome.result.embeds {
                        let (record, key) = new_root_embed(embed.embed_type.clone(), embed.encrypted_content.clone(), embed.encrypted_type.clone(), embed.encrypted_content.clone(), EmbedKeyWrapSource::ChatKey, now);
                        let embed_id = record.embed_id.clone();
                        self.embeds.create_embed(record).await?;
                        self.embeds.add_embed_key(key).await?;
                        self.embeds.finish_embed(&embed_id, embed.encrypted_content.clone()).await?;
                        self.usage.claim_creator_income(&invocation_id).await?;
                    }
                }
            }
        }

        // Step 7: settle credits.
        let breakdown = CreditBreakdown {
            preprocess: self.config.preprocess_cost,
            main_input: credits_for_tokens(main_output.usage.tokens_in, self.config.main_input_rate_per_1k),
            main_output: credits_for_tokens(main_output.usage.tokens_out, self.config.main_output_rate_per_1k),
            skills: skills_total_credits,
            postprocess: if input.is_incognito { 0 } else { self.config.postprocess_cost },
        };
        self.chats.settle_credits(&reservation, breakdown.total()).await?;

        // Step 8: Post (skipped entirely for incognito tasks).
        let (follow_up_suggestions, new_chat_suggestions, suggested_memories) = if input.is_incognito {
            (Vec::new(), Vec::new(), Vec::new())
        } else {
            self.tasks.transition(&input.task_id, TaskState::Post);
            self.run_post(input, &main_output.final_text, &main_output.messages).await
        };

        info!(task_id = %input.task_id, "task complete");
        Ok(TaskOutcome { final_text: main_output.final_text, follow_up_suggestions, new_chat_suggestions, suggested_memories })
    }

    async fn run_main(
        &self,
        input: &TaskInput,
        preprocess_output: &openmates_pipeline::preprocess::PreprocessOutput,
        history: Vec<Message>,
        sink: &dyn BlockSink,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<openmates_pipeline::main_stage::MainStageOutput> {
        let selection = self
            .config
            .main_models
            .get(&preprocess_output.model_tier)
            .ok_or_else(|| OrchestratorError::Pipeline(PipelineError::ToolRoundsExhausted(0)))?;
        let provider = self
            .providers
            .get(&selection.provider_id)
            .ok_or_else(|| OrchestratorError::Pipeline(PipelineError::ToolRoundsExhausted(0)))?;

        let tools = tool_definitions_for(&self.skill_registry, &preprocess_output.skills);

        let skill_ctx = SkillContext {
            task_id: input.task_id.clone(),
            user_id: input.user_id.clone(),
            chat_id: input.chat_id.clone(),
            secrets: self.transit.clone(),
            cancel: cancel.clone(),
        };

        let retry = self.config.retry_policy(self.config.main_stream_timeout_secs);
        let output = run_main_stage(provider.as_ref(), &selection.model, "", history, tools, &self.dispatcher, &skill_ctx, sink, retry).await?;
        Ok(output)
    }

    async fn run_post(&self, input: &TaskInput, assistant_response: &str, history: &[Message]) -> (Vec<String>, Vec<String>, Vec<SuggestedMemoryEntry>) {
        let postprocess_provider = match self.providers.get(&self.config.postprocess.provider_id) {
            Some(p) => p,
            None => return (Vec::new(), Vec::new(), Vec::new()),
        };

        let task_ctx = TaskContext {
            task_id: input.task_id.clone(),
            user_id: input.user_id.clone(),
            chat_id: input.chat_id.clone(),
            is_incognito: input.is_incognito,
            available_apps: input.available_apps.clone(),
            available_memory_categories: input.available_memory_categories.clone(),
        };
        let ctx = PostprocessContext {
            task: task_ctx,
            user_message: input.plaintext_turn.clone(),
            assistant_response: assistant_response.to_string(),
            chat_summary: String::new(),
            chat_tags: Vec::new(),
            history: history.to_vec(),
        };

        let retry = self.config.retry_policy(self.config.postprocess_timeout_secs);
        let phase1: Phase1Output = run_phase1(postprocess_provider.as_ref(), &self.config.postprocess.model, self.config.postprocess_phase1_tool.clone(), &ctx, retry).await;

        let suggested_memories = if phase1.relevant_settings_memory_categories.is_empty() {
            Vec::new()
        } else {
            run_phase2(postprocess_provider.as_ref(), &self.config.postprocess.model, self.config.postprocess_phase2_tool.clone(), &ctx, &phase1, retry).await
        };

        (phase1.follow_up_request_suggestions, phase1.new_chat_request_suggestions, suggested_memories)
    }
}

fn credits_for_tokens(tokens: u32, rate_per_1k: i64) -> i64 {
    (tokens as i64 * rate_per_1k) / 1000
}

fn tool_definitions_for(registry: &SkillRegistry, skill_names: &[String]) -> Vec<ToolDefinition> {
    skill_names
        .iter()
        .filter_map(|name| {
            let (app_id, skill_id) = name.split_once('.')?;
            let manifest = registry.get(app_id, skill_id)?;
            Some(ToolDefinition { name: manifest.qualified_name(), description: manifest.description.clone(), input_schema: manifest.tool_schema.clone() })
        })
        .collect()
}

/// Unix-second timestamp. `chrono::Utc::now()` is avoided at the call sites
/// above per the workspace's no-wall-clock-in-business-logic convention
/// (SPEC_FULL.md §4.I: "timestamps in Unix seconds") — callers that need a
/// real clock use this single seam so tests can keep passing a fixed value.
fn chrono_now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
