//! Web and social research workers.

use agentrelay_core::{
    AgentResult, AgentType, DomainPayload, ResearchFindings, ResearchInput, ResultData,
    SourceReference, TaskError, TaskId, TaskInput, TaskReader, Worker, publish,
};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::retrieve_task;

/// Researcher over news, academic and reference sites.
#[derive(Debug, Default)]
pub struct WebResearchAgent;

impl WebResearchAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for WebResearchAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::WebResearch
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        research(AgentType::WebResearch, task_id, tasks)
    }
}

/// Researcher over forums and microblogs.
#[derive(Debug, Default)]
pub struct SocialResearchAgent;

impl SocialResearchAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for SocialResearchAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::SocialResearch
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        research(AgentType::SocialResearch, task_id, tasks)
    }
}

fn research(
    domain: AgentType,
    task_id: &TaskId,
    tasks: &TaskReader,
) -> anyhow::Result<AgentResult> {
    let task = retrieve_task(tasks, task_id, domain)?;
    let TaskInput::Research(input) = &task.input_data else {
        return Err(TaskError::terminal("expected research input").into());
    };

    info!(%task_id, %domain, sub_query = %input.sub_query, "researching sub-query");
    let found = gather(domain, input);
    publish(DomainPayload::text(format!(
        "{domain}: {} finding(s) for \"{}\"",
        found.findings.len(),
        input.sub_query
    )));
    debug!(%task_id, sources = found.sources.len(), "research complete");

    let sources = found.sources.clone();
    Ok(AgentResult::succeeded(&task, ResultData::Research(found)).with_sources(sources))
}

/// One finding and one source per searched source type, capped at
/// `max_sources`.
fn gather(domain: AgentType, input: &ResearchInput) -> ResearchFindings {
    let source_types = if input.source_types.is_empty() {
        domain.default_source_types()
    } else {
        input.source_types.clone()
    };
    let slug = slugify(&input.sub_query);

    let mut findings = Vec::new();
    let mut sources = Vec::new();
    for (idx, source_type) in source_types.iter().take(input.max_sources).enumerate() {
        let (uri, claim) = match domain {
            AgentType::SocialResearch => (
                format!("https://{source_type}.example.net/t/{slug}"),
                format!("{source_type} users discuss {}", input.sub_query),
            ),
            _ => (
                format!("https://{source_type}.example.org/{slug}"),
                format!("{source_type} coverage documents {}", input.sub_query),
            ),
        };
        sources.push(SourceReference {
            id: format!("{domain}-{slug}-{}", idx + 1),
            uri,
            title: Some(format!("{source_type}: {}", input.sub_query)),
            snippet: Some(claim.clone()),
        });
        findings.push(claim);
    }

    ResearchFindings {
        sub_query: input.sub_query.clone(),
        domain,
        findings,
        sources,
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stage;

    fn input(sub_query: &str, max_sources: usize) -> TaskInput {
        TaskInput::Research(ResearchInput {
            sub_query: sub_query.into(),
            source_types: Vec::new(),
            max_sources,
        })
    }

    #[test]
    fn slugs_are_url_safe() {
        assert_eq!(slugify("How fast is Tokio?"), "how-fast-is-tokio");
        assert_eq!(slugify("  --  "), "");
    }

    #[tokio::test]
    async fn web_research_is_bounded_by_max_sources() {
        let (reader, task_id) = stage(AgentType::WebResearch, input("Rust safety", 2));
        let result = WebResearchAgent::new().invoke(&task_id, &reader).await.unwrap();

        assert_eq!(result.sources_used.len(), 2);
        match result.result_data {
            Some(ResultData::Research(found)) => {
                assert_eq!(found.domain, AgentType::WebResearch);
                assert_eq!(found.findings.len(), 2);
                assert!(found.sources[0].uri.starts_with("https://news.example.org/rust-safety"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn social_research_uses_its_own_source_types() {
        let (reader, task_id) = stage(AgentType::SocialResearch, input("Rust safety", 10));
        let result = SocialResearchAgent::new().invoke(&task_id, &reader).await.unwrap();

        assert!(result.result_data.as_ref().unwrap().matches(AgentType::SocialResearch));
        assert_eq!(result.sources_used.len(), 2);
        assert!(result.sources_used.iter().all(|s| s.uri.contains(".example.net/t/")));
    }
}
