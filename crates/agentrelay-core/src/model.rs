//! Typed tasks, results and workflow state for the research pipeline.
//!
//! Each phase has its own closed input and output type, and every output
//! knows which follow-up tasks it spawns, so phase transitions are checked
//! exhaustively instead of by inspecting loosely shaped result maps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// Unique identifier for a task
pub type TaskId = String;

/// Specialised worker kinds the coordinator can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Splits the user query into researchable sub-queries
    Decomposition,
    /// Retrieves findings from web sources
    WebResearch,
    /// Retrieves findings from social-media sources
    SocialResearch,
    /// Scores credibility and cross-source consistency
    Analysis,
    /// Writes the final report
    Synthesis,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Decomposition,
        AgentType::WebResearch,
        AgentType::SocialResearch,
        AgentType::Analysis,
        AgentType::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Decomposition => "decomposition",
            AgentType::WebResearch => "web_research",
            AgentType::SocialResearch => "social_research",
            AgentType::Analysis => "analysis",
            AgentType::Synthesis => "synthesis",
        }
    }

    pub fn is_research(&self) -> bool {
        matches!(self, AgentType::WebResearch | AgentType::SocialResearch)
    }

    /// Source types a research worker of this kind searches by default.
    pub fn default_source_types(&self) -> Vec<String> {
        let types: &[&str] = match self {
            AgentType::WebResearch => &["news", "academic", "reference"],
            AgentType::SocialResearch => &["forums", "microblogs"],
            _ => &[],
        };
        types.iter().map(|t| t.to_string()).collect()
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Fixed phase sequence of a research workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Decomposition,
    Research,
    Analysis,
    Synthesis,
    Done,
}

impl WorkflowPhase {
    pub fn next(&self) -> Option<WorkflowPhase> {
        match self {
            WorkflowPhase::Decomposition => Some(WorkflowPhase::Research),
            WorkflowPhase::Research => Some(WorkflowPhase::Analysis),
            WorkflowPhase::Analysis => Some(WorkflowPhase::Synthesis),
            WorkflowPhase::Synthesis => Some(WorkflowPhase::Done),
            WorkflowPhase::Done => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Decomposition => "decomposition",
            WorkflowPhase::Research => "research",
            WorkflowPhase::Analysis => "analysis",
            WorkflowPhase::Synthesis => "synthesis",
            WorkflowPhase::Done => "done",
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a source used by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReference {
    pub id: String,
    pub uri: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionInput {
    pub query: String,
    pub max_sub_queries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchInput {
    pub sub_query: String,
    pub source_types: Vec<String>,
    pub max_sources: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub query: String,
    pub findings: Vec<ResearchFindings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub query: String,
    pub analysis: AnalysisOutput,
    pub findings: Vec<ResearchFindings>,
}

/// Typed payload held in the task data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    Decomposition(DecompositionInput),
    Research(ResearchInput),
    Analysis(AnalysisInput),
    Synthesis(SynthesisInput),
}

impl TaskInput {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskInput::Decomposition(_) => "decompose_query",
            TaskInput::Research(_) => "research_sub_query",
            TaskInput::Analysis(_) => "analyze_findings",
            TaskInput::Synthesis(_) => "synthesize_report",
        }
    }

    /// Whether this payload is the schema expected by `agent_type`.
    pub fn matches(&self, agent_type: AgentType) -> bool {
        match self {
            TaskInput::Decomposition(_) => agent_type == AgentType::Decomposition,
            TaskInput::Research(_) => agent_type.is_research(),
            TaskInput::Analysis(_) => agent_type == AgentType::Analysis,
            TaskInput::Synthesis(_) => agent_type == AgentType::Synthesis,
        }
    }
}

/// A unit of delegated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: TaskId,
    pub workflow_id: String,
    pub agent_type: AgentType,
    pub task_type: String,
    pub input_data: TaskInput,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(
        task_id: impl Into<TaskId>,
        workflow_id: impl Into<String>,
        agent_type: AgentType,
        input_data: TaskInput,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            agent_type,
            task_type: input_data.task_type().to_string(),
            input_data,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependency(mut self, dep_id: TaskId) -> Self {
        self.dependencies.push(dep_id);
        self
    }

    pub fn with_dependencies<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = TaskId>,
    {
        self.dependencies.extend(deps);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionOutput {
    pub sub_queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub sub_query: String,
    pub domain: AgentType,
    pub findings: Vec<String>,
    pub sources: Vec<SourceReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedFinding {
    pub sub_query: String,
    pub domain: AgentType,
    pub claim: String,
    pub credibility: f32,
    pub consistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub summary: String,
    pub annotated: Vec<AnnotatedFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutput {
    pub report: String,
}

/// Closed set of per-phase worker outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultData {
    Decomposition(DecompositionOutput),
    Research(ResearchFindings),
    Analysis(AnalysisOutput),
    Synthesis(SynthesisOutput),
}

/// What the coordinator knows when deriving follow-up work.
#[derive(Debug, Clone, Copy)]
pub struct FollowUpContext<'a> {
    pub query: &'a str,
    pub research_domains: &'a [AgentType],
    pub max_sources: usize,
    pub findings: &'a [ResearchFindings],
}

impl ResultData {
    pub fn matches(&self, agent_type: AgentType) -> bool {
        match self {
            ResultData::Decomposition(_) => agent_type == AgentType::Decomposition,
            ResultData::Research(findings) => {
                agent_type.is_research() && findings.domain == agent_type
            }
            ResultData::Analysis(_) => agent_type == AgentType::Analysis,
            ResultData::Synthesis(_) => agent_type == AgentType::Synthesis,
        }
    }

    /// Tasks spawned directly by this result. Research results spawn nothing
    /// on their own; the analysis task is built once the whole research
    /// phase has been gathered.
    pub fn follow_ups(&self, ctx: &FollowUpContext<'_>) -> Vec<(AgentType, TaskInput)> {
        match self {
            ResultData::Decomposition(output) => output.research_inputs(ctx),
            ResultData::Research(_) => Vec::new(),
            ResultData::Analysis(output) => vec![(
                AgentType::Synthesis,
                TaskInput::Synthesis(output.synthesis_input(ctx)),
            )],
            ResultData::Synthesis(_) => Vec::new(),
        }
    }
}

impl DecompositionOutput {
    /// One research input per sub-query and configured domain. An empty
    /// decomposition falls back to researching the original query.
    pub fn research_inputs(&self, ctx: &FollowUpContext<'_>) -> Vec<(AgentType, TaskInput)> {
        let sub_queries: Vec<&str> = if self.sub_queries.is_empty() {
            vec![ctx.query]
        } else {
            self.sub_queries.iter().map(String::as_str).collect()
        };

        let domains = ctx.research_domains;
        let max_sources = ctx.max_sources;
        sub_queries
            .into_iter()
            .flat_map(move |sub_query| {
                domains.iter().map(move |domain| {
                    (
                        *domain,
                        TaskInput::Research(ResearchInput {
                            sub_query: sub_query.to_string(),
                            source_types: domain.default_source_types(),
                            max_sources,
                        }),
                    )
                })
            })
            .collect()
    }
}

impl AnalysisInput {
    pub fn from_findings(query: &str, findings: Vec<ResearchFindings>) -> Self {
        Self {
            query: query.to_string(),
            findings,
        }
    }
}

impl AnalysisOutput {
    pub fn synthesis_input(&self, ctx: &FollowUpContext<'_>) -> SynthesisInput {
        SynthesisInput {
            query: ctx.query.to_string(),
            analysis: self.clone(),
            findings: ctx.findings.to_vec(),
        }
    }
}

/// Outcome of one worker invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub task_id: TaskId,
    pub agent_type: AgentType,
    pub result_data: Option<ResultData>,
    pub success: bool,
    pub error_message: Option<String>,
    pub sources_used: Vec<SourceReference>,
    pub follow_up_tasks: Vec<AgentTask>,
}

impl AgentResult {
    pub fn succeeded(task: &AgentTask, data: ResultData) -> Self {
        Self {
            task_id: task.task_id.clone(),
            agent_type: task.agent_type,
            result_data: Some(data),
            success: true,
            error_message: None,
            sources_used: Vec::new(),
            follow_up_tasks: Vec::new(),
        }
    }

    pub fn failed(
        task_id: impl Into<TaskId>,
        agent_type: AgentType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_type,
            result_data: None,
            success: false,
            error_message: Some(message.into()),
            sources_used: Vec::new(),
            follow_up_tasks: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceReference>) -> Self {
        self.sources_used = sources;
        self
    }
}

/// Coordinator-owned state of one research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchWorkflow {
    pub workflow_id: String,
    pub original_query: String,
    pub current_phase: WorkflowPhase,
    pub active_tasks: Vec<TaskId>,
    pub completed_tasks: Vec<TaskId>,
    pub workflow_state: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    task_seq: u64,
}

impl ResearchWorkflow {
    pub fn new(workflow_id: impl Into<String>, original_query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            original_query: original_query.into(),
            current_phase: WorkflowPhase::Decomposition,
            active_tasks: Vec::new(),
            completed_tasks: Vec::new(),
            workflow_state: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            task_seq: 0,
        }
    }

    /// Build the next task of this workflow and mark it active.
    pub fn allocate_task(&mut self, agent_type: AgentType, input: TaskInput) -> AgentTask {
        self.task_seq += 1;
        let task_id = format!("{}:{}:{}", self.workflow_id, agent_type, self.task_seq);
        self.active_tasks.push(task_id.clone());
        self.touch();
        AgentTask::new(task_id, self.workflow_id.clone(), agent_type, input)
    }

    pub fn complete_task(&mut self, task_id: &str) {
        if let Some(pos) = self.active_tasks.iter().position(|id| id == task_id) {
            let id = self.active_tasks.remove(pos);
            self.completed_tasks.push(id);
            self.touch();
        }
    }

    /// Move one step along the phase sequence; phases are never skipped or
    /// revisited.
    pub fn advance(&mut self) -> Result<WorkflowPhase, WorkflowError> {
        let next = self
            .current_phase
            .next()
            .ok_or(WorkflowError::InvalidTransition {
                from: self.current_phase,
                to: self.current_phase,
            })?;
        self.current_phase = next;
        self.touch();
        Ok(next)
    }

    /// Advance to `target`, which must be the immediate successor.
    pub fn advance_to(&mut self, target: WorkflowPhase) -> Result<(), WorkflowError> {
        if self.current_phase.next() != Some(target) {
            return Err(WorkflowError::InvalidTransition {
                from: self.current_phase,
                to: target,
            });
        }
        self.advance().map(|_| ())
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.workflow_state.insert(key.into(), value);
        self.touch();
    }

    pub fn is_done(&self) -> bool {
        self.current_phase == WorkflowPhase::Done
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
