//! Worker contract and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WorkflowError;
use crate::model::{AgentResult, AgentType, TaskId};
use crate::store::TaskReader;

/// A specialised agent the coordinator delegates to.
///
/// Workers are only given a task id. They must fetch their own payload
/// through `tasks` before doing anything else and report an explicit
/// success flag. Returning `Err` counts as a fault; a
/// [`TaskError`](crate::TaskError) with `retryable = false` stops retries.
#[async_trait]
pub trait Worker: Send + Sync {
    fn agent_type(&self) -> AgentType;

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult>;
}

pub type DynWorker = Arc<dyn Worker>;

/// Lookup of one worker per agent type.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<AgentType, DynWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` under its own agent type, replacing any previous one.
    pub fn register(&mut self, worker: DynWorker) -> Option<DynWorker> {
        self.workers.insert(worker.agent_type(), worker)
    }

    pub fn with_worker(mut self, worker: DynWorker) -> Self {
        self.register(worker);
        self
    }

    pub fn get(&self, agent_type: AgentType) -> Result<&DynWorker, WorkflowError> {
        self.workers
            .get(&agent_type)
            .ok_or(WorkflowError::MissingWorker(agent_type))
    }

    pub fn contains(&self, agent_type: AgentType) -> bool {
        self.workers.contains_key(&agent_type)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
