//! Query decomposition.

use agentrelay_core::{
    AgentResult, AgentType, DecompositionOutput, DomainPayload, ResultData, TaskError, TaskId,
    TaskInput, TaskReader, Worker, publish,
};
use async_trait::async_trait;
use tracing::info;

use crate::retrieve_task;

/// Splits a compound query into independently researchable sub-queries.
#[derive(Debug, Default)]
pub struct DecompositionAgent;

impl DecompositionAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for DecompositionAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Decomposition
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = retrieve_task(tasks, task_id, AgentType::Decomposition)?;
        let TaskInput::Decomposition(input) = &task.input_data else {
            return Err(TaskError::terminal("expected decomposition input").into());
        };

        let sub_queries = split_query(&input.query, input.max_sub_queries);
        info!(%task_id, sub_queries = sub_queries.len(), "query decomposed");
        publish(DomainPayload::thinking(format!(
            "split query into {} sub-quer{}",
            sub_queries.len(),
            if sub_queries.len() == 1 { "y" } else { "ies" }
        )));

        Ok(AgentResult::succeeded(
            &task,
            ResultData::Decomposition(DecompositionOutput { sub_queries }),
        ))
    }
}

/// Split on `;`, `?` and the conjunction " and ". Duplicates (ignoring case)
/// are dropped; a query with no separators yields itself.
fn split_query(query: &str, max: usize) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for clause in query.split([';', '?']) {
        for part in clause.split(" and ") {
            let part = part.trim().trim_end_matches(['.', ',', '!']).trim();
            if part.is_empty() || parts.iter().any(|seen| seen.eq_ignore_ascii_case(part)) {
                continue;
            }
            parts.push(part.to_string());
        }
    }

    if parts.is_empty() && !query.trim().is_empty() {
        parts.push(query.trim().to_string());
    }
    parts.truncate(max.max(1));
    parts
}
