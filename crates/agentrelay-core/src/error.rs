use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::context::ContextId;
use crate::model::{AgentType, TaskId, WorkflowPhase};
use crate::store::AccessRole;

/// Core error type for configuration and bootstrap failures.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Misuse of the execution-context stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context stack is empty")]
    EmptyStack,
    #[error("no context stack is bound to the current task")]
    Unbound,
    #[error("context id `{0}` was already issued in this invocation")]
    DuplicateId(ContextId),
    #[error("context imbalance: expected to pop `{expected}` but top of stack was {found:?}")]
    Imbalance {
        expected: ContextId,
        found: Option<ContextId>,
    },
    #[error("context stack was poisoned by an earlier imbalance")]
    Poisoned,
}

/// Lifecycle violations on a dispatcher instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher is not bound")]
    NotBound,
    #[error("dispatcher is already bound")]
    AlreadyBound,
    #[error("dispatcher has been torn down")]
    TornDown,
}

/// Structured failures returned by the task data store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task `{task_id}` not found")]
    NotFound { task_id: TaskId },
    #[error("task `{task_id}` already exists")]
    AlreadyExists { task_id: TaskId },
    #[error("{role} may not {operation} task data")]
    Forbidden {
        role: AccessRole,
        operation: &'static str,
    },
    #[error("task `{task_id}` input does not match agent type {agent_type}")]
    SchemaMismatch {
        task_id: TaskId,
        agent_type: AgentType,
    },
}

/// Failures that terminate a research workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{phase} phase failed on task `{task_id}` after {attempts} attempt(s): {reason}")]
    PhaseFailed {
        phase: WorkflowPhase,
        task_id: TaskId,
        attempts: u32,
        reason: String,
    },
    #[error("no worker registered for agent type {0}")]
    MissingWorker(AgentType),
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },
    #[error("research workflow was cancelled")]
    Cancelled,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Phase in which the failure surfaced, when known.
    pub fn phase(&self) -> Option<WorkflowPhase> {
        match self {
            WorkflowError::PhaseFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Error representing a single worker invocation failure.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub reason: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::new(reason, true)
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::new(reason, false)
    }

    /// Classify an arbitrary worker error; anything that is not an explicit
    /// `TaskError` counts against the retry budget.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<TaskError>() {
            Some(task_error) => task_error.clone(),
            None => Self::retryable(format!("{err:#}")),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let retry = if self.retryable {
            "retryable"
        } else {
            "terminal"
        };
        write!(f, "{retry} task failure: {}", self.reason)
    }
}

impl std::error::Error for TaskError {}
