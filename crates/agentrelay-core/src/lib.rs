//! AgentRelay core: context-tagged event relay and multi-agent research
//! coordination.
//!
//! Agents call each other like tools. Every invocation runs in its own
//! context frame, and everything an invocation publishes is tagged with that
//! frame and delivered to the consumer bound for the top-level turn.

pub mod config;
pub mod context;
mod coordinator;
pub mod dispatch;
mod error;
mod invocation;
pub mod metrics;
pub mod model;
mod scope;
mod store;
pub mod telemetry;
mod trace;
mod worker;

pub use config::{ConfigLoader, CoordinatorConfig, DispatchConfig, LoggingConfig, RelayConfig};
pub use context::{ContextFrame, ContextGuard, ContextId, ContextStack, ROOT_CONTEXT_ID};
pub use coordinator::{WorkflowCoordinator, WorkflowReport};
pub use dispatch::{
    AsyncHandler, DataItem, DispatchEnvelope, Dispatcher, DispatcherState, DomainPayload,
    PayloadEvent, Subscriber, Subscription, SubscriptionFilter, SubscriptionToken, SyncHandler,
    current_dispatcher, publish,
};
pub use error::{ContextError, DispatchError, RelayError, StoreError, TaskError, WorkflowError};
pub use invocation::{TurnRequest, handle_turn};
pub use model::{
    AgentResult, AgentTask, AgentType, AnalysisInput, AnalysisOutput, AnnotatedFinding,
    DecompositionInput, DecompositionOutput, FollowUpContext, ResearchFindings, ResearchInput,
    ResearchWorkflow, ResultData, SourceReference, SynthesisInput, SynthesisOutput, TaskId,
    TaskInput, TaskStatus, WorkflowPhase,
};
pub use scope::SubscriptionScope;
pub use store::{AccessRole, TaskDataStore, TaskReader};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{EnvelopeTrace, TraceNode, TraceSummary};
pub use worker::{DynWorker, Worker, WorkerRegistry};
