//! Top-level turn handling.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::context::{self, ContextId, ROOT_CONTEXT_ID};
use crate::coordinator::{WorkflowCoordinator, WorkflowReport};
use crate::dispatch::{self, DomainPayload, Subscriber, SubscriptionFilter};
use crate::error::WorkflowError;
use crate::scope::SubscriptionScope;

/// A user query entering the system.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub query: String,
    pub root_context_id: ContextId,
    pub filter: SubscriptionFilter,
}

impl TurnRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            root_context_id: ROOT_CONTEXT_ID.to_string(),
            filter: SubscriptionFilter::all(),
        }
    }

    pub fn with_root_context_id(mut self, root_context_id: impl Into<ContextId>) -> Self {
        self.root_context_id = root_context_id.into();
        self
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Run one turn with `sink` subscribed for its whole duration.
///
/// The final report is published as content from the root context; a failed
/// workflow publishes a single error event instead. The sink has received
/// everything by the time this returns.
#[instrument(
    name = "turn",
    skip(coordinator, request, sink),
    fields(root_context_id = %request.root_context_id)
)]
pub async fn handle_turn(
    coordinator: &WorkflowCoordinator,
    request: TurnRequest,
    sink: Arc<dyn Subscriber>,
) -> Result<WorkflowReport, WorkflowError> {
    let TurnRequest {
        query,
        root_context_id,
        filter,
    } = request;

    SubscriptionScope::new(sink)
        .with_filter(filter)
        .run(context::with_root(root_context_id, async {
            let outcome = coordinator.run(&query).await;
            match &outcome {
                Ok(report) => {
                    let delivered = dispatch::publish(DomainPayload::text(report.report.clone()));
                    info!(workflow_id = %report.workflow_id, delivered, "turn complete");
                }
                Err(err) => {
                    dispatch::publish(DomainPayload::error(err.to_string()));
                }
            }
            outcome
        }))
        .await?
}
