//! Workflow coordinator for the fixed research pipeline.
//!
//! Drives `decomposition -> research -> analysis -> synthesis`, delegating
//! each task to a registered worker inside its own child context, with
//! bounded retries, per-invocation timeouts and concurrent research fan-out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures::FutureExt;
use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::context::{self, ROOT_CONTEXT_ID};
use crate::dispatch::{self, DomainPayload};
use crate::error::{ContextError, StoreError, TaskError, WorkflowError};
use crate::metrics;
use crate::model::{
    AgentResult, AgentTask, AgentType, AnalysisInput, DecompositionInput, FollowUpContext,
    ResearchFindings, ResearchWorkflow, ResultData, TaskId, TaskInput, TaskStatus, WorkflowPhase,
};
use crate::store::{AccessRole, TaskDataStore};
use crate::worker::{DynWorker, WorkerRegistry};

/// Summary of a completed workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub report: String,
    pub workflow: ResearchWorkflow,
    pub task_ids: Vec<TaskId>,
    pub attempts: usize,
    pub duration_ms: u64,
}

/// Coordinator that owns task creation, worker invocation and cleanup.
pub struct WorkflowCoordinator {
    config: CoordinatorConfig,
    workers: WorkerRegistry,
    store: Arc<TaskDataStore>,
}

impl WorkflowCoordinator {
    pub fn new(config: CoordinatorConfig, workers: WorkerRegistry) -> Self {
        Self {
            config,
            workers,
            store: Arc::new(TaskDataStore::new()),
        }
    }

    /// Use an externally owned store, e.g. to inspect it after a run.
    pub fn with_store(mut self, store: Arc<TaskDataStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> Arc<TaskDataStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one research workflow for `query`. Opens a root context when
    /// called outside of an invocation.
    pub async fn run(&self, query: &str) -> Result<WorkflowReport, WorkflowError> {
        if context::current().is_some() {
            self.run_workflow(query).await
        } else {
            context::with_root(ROOT_CONTEXT_ID, self.run_workflow(query)).await
        }
    }

    async fn run_workflow(&self, query: &str) -> Result<WorkflowReport, WorkflowError> {
        let started = Instant::now();
        let mut workflow = ResearchWorkflow::new(Uuid::new_v4().to_string(), query);
        info!(workflow_id = %workflow.workflow_id, %query, "starting research workflow");

        let ledger = TaskLedger::new(Arc::clone(&self.store));
        let outcome = self.drive(&mut workflow, &ledger).await;
        let task_ids = ledger.task_ids();
        let released = ledger.release();
        debug!(workflow_id = %workflow.workflow_id, released, "released workflow task data");

        match outcome {
            Ok(report) => {
                workflow.advance_to(WorkflowPhase::Done)?;
                let duration_ms = started.elapsed().as_millis() as u64;
                metrics::record_workflow_outcome("completed");
                info!(
                    workflow_id = %workflow.workflow_id,
                    tasks = task_ids.len(),
                    duration_ms,
                    "research workflow complete"
                );
                Ok(WorkflowReport {
                    workflow_id: workflow.workflow_id.clone(),
                    report,
                    attempts: ledger.attempts(),
                    task_ids,
                    workflow,
                    duration_ms,
                })
            }
            Err(err) => {
                metrics::record_workflow_outcome("failed");
                error!(
                    workflow_id = %workflow.workflow_id,
                    phase = %workflow.current_phase,
                    error = %err,
                    "research workflow failed"
                );
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        workflow: &mut ResearchWorkflow,
        ledger: &TaskLedger,
    ) -> Result<String, WorkflowError> {
        let decomposition = self.decompose(workflow, ledger).await?;
        workflow.advance_to(WorkflowPhase::Research)?;

        let research = self
            .research(workflow, ledger, decomposition.follow_up_tasks)
            .await?;
        workflow.advance_to(WorkflowPhase::Analysis)?;

        let analysis = self.analyze(workflow, ledger, research).await?;
        workflow.advance_to(WorkflowPhase::Synthesis)?;

        self.synthesize(workflow, ledger, analysis.follow_up_tasks)
            .await
    }

    fn follow_up_context<'a>(
        &'a self,
        workflow: &'a ResearchWorkflow,
        findings: &'a [ResearchFindings],
    ) -> FollowUpContext<'a> {
        FollowUpContext {
            query: &workflow.original_query,
            research_domains: &self.config.research_domains,
            max_sources: self.config.max_sources_per_task,
            findings,
        }
    }

    /// Decompose the query. The returned result carries one research task
    /// per sub-query and domain, each depending on the decomposition task.
    #[instrument(
        name = "phase.decomposition",
        skip_all,
        fields(workflow_id = %workflow.workflow_id)
    )]
    async fn decompose(
        &self,
        workflow: &mut ResearchWorkflow,
        ledger: &TaskLedger,
    ) -> Result<AgentResult, WorkflowError> {
        let phase = WorkflowPhase::Decomposition;
        let task = workflow.allocate_task(
            AgentType::Decomposition,
            TaskInput::Decomposition(DecompositionInput {
                query: workflow.original_query.clone(),
                max_sub_queries: self.config.max_sub_queries,
            }),
        );
        let (mut result, attempts) = self.execute_task(phase, task, ledger).await?;
        workflow.complete_task(&result.task_id);

        let data = expect_data(phase, &result, attempts)?;
        if let ResultData::Decomposition(output) = data {
            info!(sub_queries = output.sub_queries.len(), "query decomposed");
            workflow.set_state("sub_queries", serde_json::json!(output.sub_queries));
        }
        let follow_ups = data.follow_ups(&self.follow_up_context(workflow, &[]));
        allocate_follow_ups(workflow, &mut result, follow_ups);
        Ok(result)
    }

    #[instrument(
        name = "phase.research",
        skip_all,
        fields(workflow_id = %workflow.workflow_id, tasks = tasks.len())
    )]
    async fn research(
        &self,
        workflow: &mut ResearchWorkflow,
        ledger: &TaskLedger,
        tasks: Vec<AgentTask>,
    ) -> Result<GatheredResearch, WorkflowError> {
        let permits = Semaphore::new(self.config.max_concurrent_research);
        let permits = &permits;
        let runs = tasks.into_iter().map(move |task| {
            context::fork(async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| WorkflowError::Cancelled)?;
                self.execute_task(WorkflowPhase::Research, task, ledger)
                    .await
            })
        });
        let results = try_join_all(runs).await?;

        let mut gathered = GatheredResearch::default();
        for (result, attempts) in results {
            workflow.complete_task(&result.task_id);
            match result.result_data {
                Some(ResultData::Research(found)) => {
                    gathered.task_ids.push(result.task_id);
                    gathered.findings.push(found);
                }
                _ => {
                    return Err(unexpected_result(
                        WorkflowPhase::Research,
                        &result.task_id,
                        attempts,
                    ));
                }
            }
        }
        workflow.set_state("findings", serde_json::json!(gathered.findings.len()));
        Ok(gathered)
    }

    /// Analyse everything research gathered. The analysis task depends on
    /// every research task; its result carries the synthesis task.
    #[instrument(
        name = "phase.analysis",
        skip_all,
        fields(workflow_id = %workflow.workflow_id)
    )]
    async fn analyze(
        &self,
        workflow: &mut ResearchWorkflow,
        ledger: &TaskLedger,
        research: GatheredResearch,
    ) -> Result<AgentResult, WorkflowError> {
        let phase = WorkflowPhase::Analysis;
        let GatheredResearch { task_ids, findings } = research;
        let task = workflow
            .allocate_task(
                AgentType::Analysis,
                TaskInput::Analysis(AnalysisInput::from_findings(
                    &workflow.original_query,
                    findings.clone(),
                )),
            )
            .with_dependencies(task_ids);
        let (mut result, attempts) = self.execute_task(phase, task, ledger).await?;
        workflow.complete_task(&result.task_id);

        let follow_ups = expect_data(phase, &result, attempts)?
            .follow_ups(&self.follow_up_context(workflow, &findings));
        allocate_follow_ups(workflow, &mut result, follow_ups);
        Ok(result)
    }

    #[instrument(
        name = "phase.synthesis",
        skip_all,
        fields(workflow_id = %workflow.workflow_id)
    )]
    async fn synthesize(
        &self,
        workflow: &mut ResearchWorkflow,
        ledger: &TaskLedger,
        tasks: Vec<AgentTask>,
    ) -> Result<String, WorkflowError> {
        let mut report = None;
        for task in tasks {
            let (result, attempts) = self
                .execute_task(WorkflowPhase::Synthesis, task, ledger)
                .await?;
            workflow.complete_task(&result.task_id);
            match result.result_data {
                Some(ResultData::Synthesis(output)) => report = Some(output.report),
                _ => {
                    return Err(unexpected_result(
                        WorkflowPhase::Synthesis,
                        &result.task_id,
                        attempts,
                    ));
                }
            }
        }
        report.ok_or_else(|| WorkflowError::PhaseFailed {
            phase: WorkflowPhase::Synthesis,
            task_id: String::new(),
            attempts: 0,
            reason: "analysis produced no synthesis task".to_string(),
        })
    }

    /// Create the task entry, then invoke its worker until it succeeds or
    /// the retry budget is spent. Returns the result with the number of
    /// attempts it took.
    #[instrument(
        name = "coordinator.task",
        skip(self, task, ledger),
        fields(task_id = %task.task_id, agent_type = %task.agent_type)
    )]
    async fn execute_task(
        &self,
        phase: WorkflowPhase,
        task: AgentTask,
        ledger: &TaskLedger,
    ) -> Result<(AgentResult, u32), WorkflowError> {
        let worker = Arc::clone(self.workers.get(task.agent_type)?);
        let task_id = task.task_id.clone();
        let agent_type = task.agent_type;

        ledger.create(task)?;
        dispatch::publish(DomainPayload::tool_call(agent_type.as_str()));
        self.store
            .update_status(AccessRole::Coordinator, &task_id, TaskStatus::InProgress)?;

        let mut backoff_ms = self.config.initial_backoff_ms;
        let mut attempts = 0;
        let mut last_failure = TaskError::retryable("worker was never invoked");

        while attempts < self.config.max_attempts {
            attempts += 1;
            ledger.count_attempt();
            let started = Instant::now();
            let outcome = self
                .invoke_once(&worker, &task_id)
                .await?
                .and_then(|result| validate_result(result, &task_id, agent_type));

            match outcome {
                Ok(result) => {
                    metrics::record_worker_invocation(agent_type, "success", started.elapsed());
                    self.store
                        .update_status(AccessRole::Coordinator, &task_id, TaskStatus::Completed)?;
                    debug!(attempt = attempts, "task completed");
                    return Ok((result, attempts));
                }
                Err(failure) => {
                    metrics::record_worker_invocation(agent_type, "failure", started.elapsed());
                    let retry = failure.retryable && attempts < self.config.max_attempts;
                    warn!(
                        attempt = attempts,
                        retryable = failure.retryable,
                        reason = %failure.reason,
                        backoff_ms = if retry { backoff_ms } else { 0 },
                        "worker attempt failed"
                    );
                    last_failure = failure;
                    if !retry {
                        break;
                    }

                    metrics::record_retry(agent_type);
                    if backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = next_backoff(backoff_ms, self.config.max_backoff_ms);
                    }
                }
            }
        }

        self.store
            .update_status(AccessRole::Coordinator, &task_id, TaskStatus::Failed)?;
        error!(attempts, reason = %last_failure.reason, "task failed permanently");
        Err(WorkflowError::PhaseFailed {
            phase,
            task_id,
            attempts,
            reason: last_failure.reason,
        })
    }

    /// One attempt inside a fresh child context. The outer error is reserved
    /// for context corruption, which is never retried.
    async fn invoke_once(
        &self,
        worker: &DynWorker,
        task_id: &TaskId,
    ) -> Result<Result<AgentResult, TaskError>, WorkflowError> {
        let guard = context::enter(worker.agent_type().as_str())?;
        debug!(context_id = %guard.id(), "invoking worker");

        let reader = self.store.reader();
        let timeout_ms = self.config.worker_timeout_ms;
        let invocation = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            worker.invoke(task_id, &reader),
        );
        let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(TaskError::from_anyhow(&err)),
            Ok(Err(_elapsed)) => Err(TaskError::retryable(format!(
                "worker timed out after {timeout_ms}ms"
            ))),
            Err(_) => Err(TaskError::retryable("worker panicked")),
        };
        drop(guard);

        if context::is_poisoned() {
            return Err(ContextError::Poisoned.into());
        }
        Ok(outcome)
    }
}

fn validate_result(
    result: AgentResult,
    task_id: &str,
    agent_type: AgentType,
) -> Result<AgentResult, TaskError> {
    if !result.success {
        return Err(TaskError::retryable(
            result
                .error_message
                .unwrap_or_else(|| "worker reported failure".to_string()),
        ));
    }
    if result.task_id != task_id {
        return Err(TaskError::terminal(format!(
            "worker answered for task `{}`",
            result.task_id
        )));
    }
    match &result.result_data {
        Some(data) if data.matches(agent_type) => Ok(result),
        _ => Err(TaskError::terminal(format!(
            "worker returned no {agent_type} result data"
        ))),
    }
}

fn expect_data(
    phase: WorkflowPhase,
    result: &AgentResult,
    attempts: u32,
) -> Result<&ResultData, WorkflowError> {
    result
        .result_data
        .as_ref()
        .ok_or_else(|| unexpected_result(phase, &result.task_id, attempts))
}

fn unexpected_result(phase: WorkflowPhase, task_id: &str, attempts: u32) -> WorkflowError {
    WorkflowError::PhaseFailed {
        phase,
        task_id: task_id.to_string(),
        attempts,
        reason: "unexpected result data".to_string(),
    }
}

/// Doubles the delay, capped at `max_ms`.
fn next_backoff(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}

/// Allocate the tasks spawned by `result` and record them on it. Each one
/// depends on the task that produced `result`.
fn allocate_follow_ups(
    workflow: &mut ResearchWorkflow,
    result: &mut AgentResult,
    follow_ups: Vec<(AgentType, TaskInput)>,
) {
    result.follow_up_tasks = follow_ups
        .into_iter()
        .map(|(agent_type, input)| {
            workflow
                .allocate_task(agent_type, input)
                .with_dependency(result.task_id.clone())
        })
        .collect();
}

/// Research phase output handed to analysis.
#[derive(Debug, Default)]
struct GatheredResearch {
    task_ids: Vec<TaskId>,
    findings: Vec<ResearchFindings>,
}

/// Tasks created for one workflow. Whatever is still stored when the ledger
/// is dropped gets deleted, so failures and cancellation clean up too.
struct TaskLedger {
    store: Arc<TaskDataStore>,
    created: DashSet<TaskId>,
    attempts: AtomicUsize,
}

impl TaskLedger {
    fn new(store: Arc<TaskDataStore>) -> Self {
        Self {
            store,
            created: DashSet::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    fn create(&self, task: AgentTask) -> Result<(), StoreError> {
        let task_id = task.task_id.clone();
        self.store.store(AccessRole::Coordinator, task)?;
        self.created.insert(task_id);
        Ok(())
    }

    fn count_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.created.iter().map(|id| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Delete every recorded task; returns how many entries were removed.
    fn release(&self) -> usize {
        let ids: Vec<TaskId> = self.created.iter().map(|id| id.clone()).collect();
        let mut removed = 0;
        for id in ids {
            self.created.remove(&id);
            if let Ok(true) = self.store.delete(AccessRole::Coordinator, &id) {
                removed += 1;
            }
        }
        removed
    }
}

impl Drop for TaskLedger {
    fn drop(&mut self) {
        let removed = self.release();
        if removed > 0 {
            debug!(removed, "released task data on early exit");
        }
    }
}
