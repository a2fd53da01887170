//! Credibility and consistency analysis.

use std::collections::HashSet;

use agentrelay_core::{
    AgentResult, AgentType, AnalysisOutput, AnnotatedFinding, DomainPayload, ResearchFindings,
    ResultData, TaskError, TaskId, TaskInput, TaskReader, Worker, publish,
};
use async_trait::async_trait;
use tracing::info;

use crate::retrieve_task;

const CORROBORATION_BONUS: f32 = 0.1;

/// Scores every finding and flags claims backed by more than one domain.
#[derive(Debug, Default)]
pub struct AnalysisAgent;

impl AnalysisAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for AnalysisAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Analysis
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = retrieve_task(tasks, task_id, AgentType::Analysis)?;
        let TaskInput::Analysis(input) = &task.input_data else {
            return Err(TaskError::terminal("expected analysis input").into());
        };

        let output = analyze(&input.findings);
        info!(%task_id, annotated = output.annotated.len(), "analysis complete");
        publish(DomainPayload::thinking(output.summary.clone()));

        Ok(AgentResult::succeeded(&task, ResultData::Analysis(output)))
    }
}

fn base_credibility(domain: AgentType) -> f32 {
    match domain {
        AgentType::WebResearch => 0.8,
        AgentType::SocialResearch => 0.5,
        _ => 0.0,
    }
}

fn analyze(findings: &[ResearchFindings]) -> AnalysisOutput {
    // (sub-query, domain) pairs that returned at least one claim
    let covered: HashSet<(&str, AgentType)> = findings
        .iter()
        .filter(|f| !f.findings.is_empty())
        .map(|f| (f.sub_query.as_str(), f.domain))
        .collect();

    let mut annotated = Vec::new();
    for found in findings {
        let consistent = covered
            .iter()
            .any(|(sub_query, domain)| *sub_query == found.sub_query && *domain != found.domain);
        let mut credibility = base_credibility(found.domain);
        if consistent {
            credibility = (credibility + CORROBORATION_BONUS).min(1.0);
        }
        for claim in &found.findings {
            annotated.push(AnnotatedFinding {
                sub_query: found.sub_query.clone(),
                domain: found.domain,
                claim: claim.clone(),
                credibility,
                consistent,
            });
        }
    }

    let sub_queries: HashSet<&str> = findings.iter().map(|f| f.sub_query.as_str()).collect();
    let corroborated = annotated.iter().filter(|a| a.consistent).count();
    AnalysisOutput {
        summary: format!(
            "{} finding(s) across {} sub-quer{}; {} corroborated across domains",
            annotated.len(),
            sub_queries.len(),
            if sub_queries.len() == 1 { "y" } else { "ies" },
            corroborated
        ),
        annotated,
    }
}
