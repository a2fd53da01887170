//! Offline reference workers for the research pipeline.
//!
//! Every agent here is deterministic: given the same task it produces the
//! same findings, which keeps the CLI and end-to-end tests reproducible.

mod analyst;
mod decomposer;
mod researcher;
mod synthesizer;

use std::sync::Arc;

use agentrelay_core::{AgentTask, AgentType, TaskError, TaskId, TaskReader, WorkerRegistry};

pub use analyst::AnalysisAgent;
pub use decomposer::DecompositionAgent;
pub use researcher::{SocialResearchAgent, WebResearchAgent};
pub use synthesizer::SynthesisAgent;

/// Registry with one reference worker per agent type.
pub fn default_registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .with_worker(Arc::new(DecompositionAgent::new()))
        .with_worker(Arc::new(WebResearchAgent::new()))
        .with_worker(Arc::new(SocialResearchAgent::new()))
        .with_worker(Arc::new(AnalysisAgent::new()))
        .with_worker(Arc::new(SynthesisAgent::new()))
}

/// Fetch the task a worker was handed and check its payload schema. A task
/// that cannot be read will not appear on retry, so both failures are
/// terminal.
pub(crate) fn retrieve_task(
    tasks: &TaskReader,
    task_id: &TaskId,
    agent_type: AgentType,
) -> anyhow::Result<AgentTask> {
    let task = tasks
        .retrieve(task_id)
        .map_err(|err| TaskError::terminal(err.to_string()))?;
    if !task.input_data.matches(agent_type) {
        return Err(TaskError::terminal(format!(
            "task `{task_id}` carries {} input, not a {agent_type} payload",
            task.task_type
        ))
        .into());
    }
    Ok(task)
}
