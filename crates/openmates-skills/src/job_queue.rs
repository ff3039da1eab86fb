//! The `queued` execution transport (SPEC_FULL.md §4.E.1): a narrow interface
//! the dispatcher uses to hand a job to a worker pool and await its result,
//! kept as thin as the repository traits in §3.1 so the core depends on the
//! *shape* of a broker, never a specific one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use openmates_core::types::TaskId;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::dispatcher::SkillResult;
use crate::error::{Result, SkillError};

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub task_id: TaskId,
    pub app_id: String,
    pub skill_id: String,
    pub args: serde_json::Value,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: QueuedJob) -> Result<String>;
    async fn await_result(&self, correlation_id: &str, deadline: Duration) -> Result<SkillResult>;
}

type Worker = Arc<dyn Fn(QueuedJob) -> Pin<Box<dyn Future<Output = SkillResult> + Send>> + Send + Sync>;

/// Channel-backed stand-in for a real message broker, used by tests and by
/// single-process deployments that run their own worker inline.
pub struct InMemoryJobQueue {
    worker: Worker,
    pending: DashMap<String, oneshot::Receiver<SkillResult>>,
}

impl InMemoryJobQueue {
    pub fn new<F, Fut>(worker: F) -> Self
    where
        F: Fn(QueuedJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SkillResult> + Send + 'static,
    {
        Self {
            worker: Arc::new(move |job| Box::pin(worker(job))),
            pending: DashMap::new(),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<String> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), rx);

        let worker = self.worker.clone();
        tokio::spawn(async move {
            let result = worker(job).await;
            let _ = tx.send(result);
        });

        Ok(correlation_id)
    }

    async fn await_result(&self, correlation_id: &str, deadline: Duration) -> Result<SkillResult> {
        let mut rx = self
            .pending
            .remove(correlation_id)
            .map(|(_, rx)| rx)
            .ok_or_else(|| SkillError::Execution(format!("unknown correlation id {correlation_id}")))?;

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(SkillError::Execution("worker dropped without a result".to_string())),
            Err(_) => Err(SkillError::QueueDeadline),
        }
    }
}
