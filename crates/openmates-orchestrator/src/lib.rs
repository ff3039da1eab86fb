//! The orchestrator ties `openmates-pipeline`'s stages, `openmates-skills`'
//! dispatcher, and the four repository traits into the per-turn procedure
//! SPEC_FULL.md §4.H describes. Everything else in the workspace is a library
//! this crate calls; this is the one crate with an opinion about the order
//! things happen in.

pub mod credit;
pub mod embed;
pub mod error;
pub mod orchestrator;
pub mod record_store;
pub mod task;

pub use credit::{minimum_reservation, CreditBreakdown};
pub use embed::{check_key_coverage, hash_embed_id, new_child_embed, new_root_embed};
pub use error::{OrchestratorError, RecordStoreError, Result, StoreResult};
pub use orchestrator::{ModelSelection, Orchestrator, OrchestratorConfig, TaskInput, TaskOutcome};
pub use record_store::{Chat, ChatRepo, EmbedKeyRecord, EmbedKeyWrapSource, EmbedRecord, EmbedRepo, InMemoryStore, MessageRepo, ReservationId, UsageRepo};
pub use task::{TaskRegistry, TaskState};
