//! Access-controlled storage for per-task payloads.
//!
//! The coordinator is the only role allowed to create or delete entries.
//! Workers get a [`TaskReader`], which can fetch exactly the entry it is
//! asked for and nothing else.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::model::{AgentTask, TaskId, TaskStatus};

/// Caller identity presented to mutating store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessRole {
    Coordinator,
    Worker,
}

impl fmt::Display for AccessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRole::Coordinator => f.write_str("coordinator"),
            AccessRole::Worker => f.write_str("worker"),
        }
    }
}

/// In-memory keyed task storage shared by one coordinator and its workers.
#[derive(Debug, Default)]
pub struct TaskDataStore {
    entries: DashMap<TaskId, AgentTask>,
}

impl TaskDataStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a new task. Rejects non-coordinators, duplicate ids and inputs
    /// that do not fit the task's agent type.
    pub fn store(&self, role: AccessRole, task: AgentTask) -> Result<(), StoreError> {
        require_coordinator(role, "create")?;
        if !task.input_data.matches(task.agent_type) {
            return Err(StoreError::SchemaMismatch {
                task_id: task.task_id,
                agent_type: task.agent_type,
            });
        }

        match self.entries.entry(task.task_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                task_id: task.task_id,
            }),
            Entry::Vacant(slot) => {
                debug!(task_id = %task.task_id, agent_type = %task.agent_type, "stored task data");
                slot.insert(task);
                Ok(())
            }
        }
    }

    pub fn retrieve(&self, task_id: &str) -> Result<AgentTask, StoreError> {
        self.entries
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Remove a task; returns whether an entry existed.
    pub fn delete(&self, role: AccessRole, task_id: &str) -> Result<bool, StoreError> {
        require_coordinator(role, "delete")?;
        Ok(self.entries.remove(task_id).is_some())
    }

    /// Coordinator bookkeeping of task status and timestamps.
    pub fn update_status(
        &self,
        role: AccessRole,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        require_coordinator(role, "update")?;
        let mut entry = self
            .entries
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })?;
        let now = Utc::now();
        match status {
            TaskStatus::InProgress => entry.assigned_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => entry.completed_at = Some(now),
            TaskStatus::Pending => {}
        }
        entry.status = status;
        Ok(())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reader(self: &Arc<Self>) -> TaskReader {
        TaskReader {
            store: Arc::clone(self),
        }
    }
}

fn require_coordinator(role: AccessRole, operation: &'static str) -> Result<(), StoreError> {
    match role {
        AccessRole::Coordinator => Ok(()),
        AccessRole::Worker => Err(StoreError::Forbidden { role, operation }),
    }
}

/// Read-only view handed to workers.
#[derive(Debug, Clone)]
pub struct TaskReader {
    store: Arc<TaskDataStore>,
}

impl TaskReader {
    pub fn retrieve(&self, task_id: &str) -> Result<AgentTask, StoreError> {
        self.store.retrieve(task_id)
    }
}
