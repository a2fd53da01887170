//! Coordinator behaviour against scripted workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentrelay_core::{
    AgentResult, AgentType, AnalysisInput, AnalysisOutput, ContextError, CoordinatorConfig,
    DecompositionOutput, Dispatcher, DispatcherState, DomainPayload, EnvelopeTrace, PayloadEvent,
    ResearchFindings, ResultData, StoreError, SynthesisOutput, TaskError, TaskId, TaskInput,
    TaskReader, TurnRequest, Worker, WorkerRegistry, WorkflowCoordinator, WorkflowError,
    WorkflowPhase, context, current_dispatcher, handle_turn, publish,
};
use async_trait::async_trait;
use tokio::sync::Notify;

struct Decomposer {
    sub_queries: Vec<String>,
}

#[async_trait]
impl Worker for Decomposer {
    fn agent_type(&self) -> AgentType {
        AgentType::Decomposition
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = tasks.retrieve(task_id)?;
        Ok(AgentResult::succeeded(
            &task,
            ResultData::Decomposition(DecompositionOutput {
                sub_queries: self.sub_queries.clone(),
            }),
        ))
    }
}

#[derive(Clone, Copy)]
enum Fault {
    None,
    Report,
    Terminal,
    Panic,
    Stall,
}

/// Research worker that misbehaves for its first `fail_first` calls.
struct ScriptedResearcher {
    domain: AgentType,
    fail_first: usize,
    fault: Fault,
    calls: AtomicUsize,
}

impl ScriptedResearcher {
    fn new(domain: AgentType) -> Self {
        Self {
            domain,
            fail_first: 0,
            fault: Fault::None,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(domain: AgentType, fail_first: usize, fault: Fault) -> Self {
        Self {
            fail_first,
            fault,
            ..Self::new(domain)
        }
    }
}

#[async_trait]
impl Worker for ScriptedResearcher {
    fn agent_type(&self) -> AgentType {
        self.domain
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = tasks.retrieve(task_id)?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            match self.fault {
                Fault::None => {}
                Fault::Report => {
                    return Ok(AgentResult::failed(task_id.clone(), self.domain, "rate limited"));
                }
                Fault::Terminal => {
                    return Err(TaskError::terminal("unsupported source").into());
                }
                Fault::Panic => panic!("researcher crashed"),
                Fault::Stall => tokio::time::sleep(Duration::from_secs(5)).await,
            }
        }

        let TaskInput::Research(input) = task.input_data.clone() else {
            return Err(TaskError::terminal("expected research input").into());
        };
        publish(DomainPayload::text(format!("searching {}", input.sub_query)));
        Ok(AgentResult::succeeded(
            &task,
            ResultData::Research(ResearchFindings {
                sub_query: input.sub_query.clone(),
                domain: self.domain,
                findings: vec![format!("{} finding", input.sub_query)],
                sources: Vec::new(),
            }),
        ))
    }
}

#[derive(Default)]
struct RecordingAnalyst {
    seen: Mutex<Option<AnalysisInput>>,
    dependencies: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl Worker for RecordingAnalyst {
    fn agent_type(&self) -> AgentType {
        AgentType::Analysis
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = tasks.retrieve(task_id)?;
        if let TaskInput::Analysis(input) = &task.input_data {
            *self.seen.lock().unwrap() = Some(input.clone());
        }
        *self.dependencies.lock().unwrap() = task.dependencies.clone();
        Ok(AgentResult::succeeded(
            &task,
            ResultData::Analysis(AnalysisOutput {
                summary: "consistent".into(),
                annotated: Vec::new(),
            }),
        ))
    }
}

struct Synthesizer;

#[async_trait]
impl Worker for Synthesizer {
    fn agent_type(&self) -> AgentType {
        AgentType::Synthesis
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        let task = tasks.retrieve(task_id)?;
        let TaskInput::Synthesis(input) = &task.input_data else {
            return Err(TaskError::terminal("expected synthesis input").into());
        };
        if task.dependencies.len() != 1 {
            return Err(TaskError::terminal("synthesis must follow exactly one analysis").into());
        }
        let mut sub_queries: Vec<_> = input.findings.iter().map(|f| f.sub_query.as_str()).collect();
        sub_queries.sort();
        Ok(AgentResult::succeeded(
            &task,
            ResultData::Synthesis(SynthesisOutput {
                report: format!("report on {}", sub_queries.join(", ")),
            }),
        ))
    }
}

/// Decomposer that enters a context and never leaves it.
#[derive(Default)]
struct LeakingDecomposer {
    calls: AtomicUsize,
}

#[async_trait]
impl Worker for LeakingDecomposer {
    fn agent_type(&self) -> AgentType {
        AgentType::Decomposition
    }

    async fn invoke(&self, task_id: &TaskId, tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let task = tasks.retrieve(task_id)?;
        std::mem::forget(context::enter("scratch")?);
        Ok(AgentResult::succeeded(
            &task,
            ResultData::Decomposition(DecompositionOutput {
                sub_queries: vec!["A".into()],
            }),
        ))
    }
}

/// Research worker that hangs after recording the dispatcher it runs under.
#[derive(Default)]
struct HangingResearcher {
    started: Notify,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
}

#[async_trait]
impl Worker for HangingResearcher {
    fn agent_type(&self) -> AgentType {
        AgentType::WebResearch
    }

    async fn invoke(&self, _task_id: &TaskId, _tasks: &TaskReader) -> anyhow::Result<AgentResult> {
        *self.dispatcher.lock().unwrap() = current_dispatcher();
        self.started.notify_one();
        std::future::pending().await
    }
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        research_domains: vec![AgentType::WebResearch],
        worker_timeout_ms: 1_000,
        ..CoordinatorConfig::default()
    }
}

fn registry(researcher: ScriptedResearcher, analyst: Arc<RecordingAnalyst>) -> WorkerRegistry {
    WorkerRegistry::new()
        .with_worker(Arc::new(Decomposer {
            sub_queries: vec!["A".into(), "B".into()],
        }))
        .with_worker(Arc::new(researcher))
        .with_worker(analyst)
        .with_worker(Arc::new(Synthesizer))
}

#[tokio::test]
async fn retry_recovers_on_third_attempt() {
    let workers = WorkerRegistry::new()
        .with_worker(Arc::new(Decomposer {
            sub_queries: vec!["only".into()],
        }))
        .with_worker(Arc::new(ScriptedResearcher::failing(
            AgentType::WebResearch,
            2,
            Fault::Report,
        )))
        .with_worker(Arc::new(RecordingAnalyst::default()))
        .with_worker(Arc::new(Synthesizer));
    let coordinator = WorkflowCoordinator::new(config(), workers);

    let report = coordinator.run("only").await.unwrap();

    assert_eq!(report.report, "report on only");
    // decomposition, three research attempts, analysis, synthesis
    assert_eq!(report.attempts, 6);
    assert!(report.workflow.is_done());
}

#[tokio::test]
async fn exhausted_budget_fails_without_advancing() {
    let analyst = Arc::new(RecordingAnalyst::default());
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(
            ScriptedResearcher::failing(AgentType::WebResearch, usize::MAX, Fault::Report),
            Arc::clone(&analyst),
        ),
    );

    let err = coordinator.run("A and B").await.unwrap_err();
    match err {
        WorkflowError::PhaseFailed {
            phase,
            attempts,
            reason,
            ..
        } => {
            assert_eq!(phase, WorkflowPhase::Research);
            assert_eq!(attempts, 3);
            assert_eq!(reason, "rate limited");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(analyst.seen.lock().unwrap().is_none());
    assert!(coordinator.store().is_empty());
}

#[tokio::test]
async fn terminal_failure_skips_remaining_attempts() {
    let researcher = Arc::new(ScriptedResearcher::failing(
        AgentType::WebResearch,
        usize::MAX,
        Fault::Terminal,
    ));
    let workers = WorkerRegistry::new()
        .with_worker(Arc::new(Decomposer {
            sub_queries: vec!["A".into()],
        }))
        .with_worker(Arc::clone(&researcher) as Arc<dyn Worker>)
        .with_worker(Arc::new(RecordingAnalyst::default()))
        .with_worker(Arc::new(Synthesizer));
    let coordinator = WorkflowCoordinator::new(config(), workers);

    let err = coordinator.run("A").await.unwrap_err();
    assert!(matches!(err, WorkflowError::PhaseFailed { attempts: 1, .. }));
    assert_eq!(researcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panics_and_timeouts_count_as_retryable_faults() {
    let analyst = Arc::new(RecordingAnalyst::default());
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(
            ScriptedResearcher::failing(AgentType::WebResearch, 1, Fault::Panic),
            Arc::clone(&analyst),
        ),
    );
    // One of the two research tasks absorbs the panic and succeeds on retry.
    assert!(coordinator.run("A and B").await.is_ok());

    let stalled = WorkflowCoordinator::new(
        CoordinatorConfig {
            worker_timeout_ms: 20,
            max_attempts: 2,
            ..config()
        },
        registry(
            ScriptedResearcher::failing(AgentType::WebResearch, usize::MAX, Fault::Stall),
            analyst,
        ),
    );
    match stalled.run("A and B").await.unwrap_err() {
        WorkflowError::PhaseFailed {
            attempts, reason, ..
        } => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_sub_queries_reach_analysis_once_each() {
    let analyst = Arc::new(RecordingAnalyst::default());
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(ScriptedResearcher::new(AgentType::WebResearch), Arc::clone(&analyst)),
    );

    let report = coordinator.run("A and B").await.unwrap();
    assert_eq!(report.report, "report on A, B");

    let seen = analyst.seen.lock().unwrap().clone().unwrap();
    let mut sub_queries: Vec<_> = seen.findings.iter().map(|f| f.sub_query.clone()).collect();
    sub_queries.sort();
    assert_eq!(sub_queries, vec!["A", "B"]);
}

#[tokio::test]
async fn analysis_task_depends_on_every_research_task() {
    let analyst = Arc::new(RecordingAnalyst::default());
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(ScriptedResearcher::new(AgentType::WebResearch), Arc::clone(&analyst)),
    );

    let report = coordinator.run("A and B").await.unwrap();

    let research_ids: Vec<TaskId> = report
        .task_ids
        .iter()
        .filter(|id| id.contains(":web_research:"))
        .cloned()
        .collect();
    assert_eq!(research_ids.len(), 2);
    let mut dependencies = analyst.dependencies.lock().unwrap().clone();
    dependencies.sort();
    assert_eq!(dependencies, research_ids);
}

#[tokio::test]
async fn leaked_context_aborts_without_retrying() {
    let decomposer = Arc::new(LeakingDecomposer::default());
    let workers = WorkerRegistry::new()
        .with_worker(Arc::clone(&decomposer) as Arc<dyn Worker>)
        .with_worker(Arc::new(ScriptedResearcher::new(AgentType::WebResearch)))
        .with_worker(Arc::new(RecordingAnalyst::default()))
        .with_worker(Arc::new(Synthesizer));
    let coordinator = WorkflowCoordinator::new(config(), workers);

    let err = coordinator.run("A").await.unwrap_err();

    assert!(
        matches!(err, WorkflowError::Context(ContextError::Poisoned)),
        "{err:?}"
    );
    assert_eq!(decomposer.calls.load(Ordering::SeqCst), 1);
    assert!(coordinator.store().is_empty());
}

#[tokio::test]
async fn cancelled_turn_releases_tasks_and_subscribers() {
    let researcher = Arc::new(HangingResearcher::default());
    let workers = WorkerRegistry::new()
        .with_worker(Arc::new(Decomposer {
            sub_queries: vec!["A".into(), "B".into()],
        }))
        .with_worker(Arc::clone(&researcher) as Arc<dyn Worker>)
        .with_worker(Arc::new(RecordingAnalyst::default()))
        .with_worker(Arc::new(Synthesizer));
    let coordinator = WorkflowCoordinator::new(config(), workers);
    let store = coordinator.store();

    {
        let sink = EnvelopeTrace::new().subscriber();
        let turn = handle_turn(&coordinator, TurnRequest::new("A and B"), sink);
        tokio::select! {
            _ = turn => panic!("turn finished while research was hanging"),
            _ = researcher.started.notified() => {}
        }
    }

    assert!(store.is_empty());
    let dispatcher = researcher
        .dispatcher
        .lock()
        .unwrap()
        .clone()
        .expect("researcher ran under a bound dispatcher");
    assert_eq!(dispatcher.state(), DispatcherState::TornDown);
    assert_eq!(dispatcher.subscriber_count(), 0);
}

#[tokio::test]
async fn completed_workflow_leaves_no_task_data() {
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(
            ScriptedResearcher::new(AgentType::WebResearch),
            Arc::new(RecordingAnalyst::default()),
        ),
    );
    let store = coordinator.store();

    let report = coordinator.run("A and B").await.unwrap();

    // decomposition, two research tasks, analysis, synthesis
    assert_eq!(report.task_ids.len(), 5);
    for task_id in &report.task_ids {
        assert!(task_id.starts_with(&report.workflow_id));
        assert_eq!(
            store.retrieve(task_id),
            Err(StoreError::NotFound {
                task_id: task_id.clone()
            })
        );
    }
    assert_eq!(report.workflow.completed_tasks.len(), 5);
    assert!(report.workflow.active_tasks.is_empty());
}

#[tokio::test]
async fn worker_events_are_tagged_with_child_contexts() {
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(
            ScriptedResearcher::new(AgentType::WebResearch),
            Arc::new(RecordingAnalyst::default()),
        ),
    );
    let trace = EnvelopeTrace::new();

    handle_turn(&coordinator, TurnRequest::new("A and B"), trace.subscriber())
        .await
        .unwrap();

    let envelopes = trace.envelopes();
    let progress: Vec<_> = envelopes
        .iter()
        .filter(|e| {
            e.payload
                .content
                .as_deref()
                .is_some_and(|c| c.starts_with("searching"))
        })
        .collect();
    assert_eq!(progress.len(), 2);
    for envelope in &progress {
        assert_eq!(envelope.depth, 1);
        assert_eq!(envelope.parent_context_id.as_deref(), Some("root"));
        assert!(envelope.context_id.starts_with("root.web_research."));
    }
    assert_ne!(progress[0].context_id, progress[1].context_id);

    let tool_calls = envelopes
        .iter()
        .filter(|e| matches!(e.payload.event, Some(PayloadEvent::ToolCall { .. })))
        .collect::<Vec<_>>();
    assert_eq!(tool_calls.len(), 5);
    assert!(tool_calls.iter().all(|e| e.depth == 0));

    let last = envelopes.last().unwrap();
    assert_eq!(last.context_id, "root");
    assert_eq!(last.payload.content.as_deref(), Some("report on A, B"));
}

#[tokio::test]
async fn failed_turn_publishes_final_error_event() {
    let coordinator = WorkflowCoordinator::new(
        config(),
        registry(
            ScriptedResearcher::failing(AgentType::WebResearch, usize::MAX, Fault::Report),
            Arc::new(RecordingAnalyst::default()),
        ),
    );
    let trace = EnvelopeTrace::new();

    let err = handle_turn(&coordinator, TurnRequest::new("A and B"), trace.subscriber())
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some(WorkflowPhase::Research));

    let envelopes = trace.envelopes();
    let errors: Vec<_> = envelopes
        .iter()
        .filter(|e| matches!(e.payload.event, Some(PayloadEvent::Error { .. })))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].depth, 0);
    assert_eq!(envelopes.last(), Some(*errors.first().unwrap()));
}
