pub mod dispatcher;
pub mod error;
pub mod job_queue;
pub mod manifest;

pub use dispatcher::{Dispatcher, DispatchOutcome, Skill, SkillContext, SkillEmbed, SkillResult};
pub use error::{Result, SkillError};
pub use job_queue::{InMemoryJobQueue, JobQueue, QueuedJob};
pub use manifest::{Manifest, Pricing, SkillRegistry, SkillStage};
