//! Markdown report writer.

use std::collections::HashSet;
use std::fmt::Write as _;

use agentrelay_core::{
    AgentResult, AgentType, DomainPayload, ResultData, SourceReference, SynthesisInput,
    SynthesisOutput, TaskError, TaskId, TaskInput, TaskReader, Worker, publish,
};
use async_trait::async_trait;
use tracing::info;

use crate::retrieve_task;

#[derive(Debug, Default)]
pub struct SynthesisAgent;

impl SynthesisAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for SynthesisAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Synthesis
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = retrieve_task(tasks, task_id, AgentType::Synthesis)?;
        let TaskInput::Synthesis(input) = &task.input_data else {
            return Err(TaskError::terminal("expected synthesis input").into());
        };

        let sources = collect_sources(input);
        let report = render_report(input, &sources);
        info!(%task_id, sources = sources.len(), "report written");
        publish(DomainPayload::thinking(format!(
            "compiled report from {} source(s)",
            sources.len()
        )));

        Ok(
            AgentResult::succeeded(&task, ResultData::Synthesis(SynthesisOutput { report }))
                .with_sources(sources),
        )
    }
}

/// Distinct sources in the order findings cite them.
fn collect_sources(input: &SynthesisInput) -> Vec<SourceReference> {
    let mut seen = HashSet::new();
    input
        .findings
        .iter()
        .flat_map(|found| found.sources.iter())
        .filter(|source| seen.insert(source.id.clone()))
        .cloned()
        .collect()
}

fn render_report(input: &SynthesisInput, sources: &[SourceReference]) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "# Research report: {}\n", input.query);
    let _ = writeln!(report, "{}\n", input.analysis.summary);

    let mut sub_queries: Vec<&str> = Vec::new();
    for found in &input.findings {
        if !sub_queries.contains(&found.sub_query.as_str()) {
            sub_queries.push(&found.sub_query);
        }
    }

    for sub_query in sub_queries {
        let _ = writeln!(report, "## {sub_query}\n");
        let claims: Vec<_> = input
            .analysis
            .annotated
            .iter()
            .filter(|a| a.sub_query == sub_query)
            .collect();
        if claims.is_empty() {
            report.push_str("_No findings._\n");
        }
        for claim in claims {
            let _ = writeln!(
                report,
                "- {} ({}, credibility {:.2}{})",
                claim.claim,
                claim.domain,
                claim.credibility,
                if claim.consistent { ", corroborated" } else { "" }
            );
        }
        report.push('\n');
    }

    report.push_str("## Sources\n\n");
    if sources.is_empty() {
        report.push_str("_None._\n");
    }
    for source in sources {
        let title = source.title.as_deref().unwrap_or(&source.id);
        let _ = writeln!(report, "- [{title}]({})", source.uri);
    }
    report
}
