use std::time::Duration;

use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::model::AgentType;

struct CoordinatorMetrics {
    invocations: Counter<u64>,
    duration_ms: Histogram<f64>,
    retries: Counter<u64>,
    workflows: Counter<u64>,
}

static METRICS: OnceCell<CoordinatorMetrics> = OnceCell::new();

fn handles() -> &'static CoordinatorMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("agentrelay.coordinator");
        CoordinatorMetrics {
            invocations: meter
                .u64_counter("worker_invocations_total")
                .with_description("Worker invocations by agent type and status")
                .init(),
            duration_ms: meter
                .f64_histogram("worker_duration_ms")
                .with_description("Worker invocation latency in milliseconds")
                .init(),
            retries: meter
                .u64_counter("worker_retries_total")
                .with_description("Worker attempts scheduled after a failure")
                .init(),
            workflows: meter
                .u64_counter("workflow_outcomes_total")
                .with_description("Research workflows by terminal outcome")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("AGENTRELAY_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "AGENTRELAY_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export coordinator metrics."
        );
    }
    Ok(())
}

/// Record one worker invocation (no-op if no provider installed).
pub fn record_worker_invocation(agent_type: AgentType, status: &str, elapsed: Duration) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("agent_type", agent_type.as_str()),
        KeyValue::new("status", status.to_string()),
    ];
    metrics.invocations.add(1, &attrs);
    metrics
        .duration_ms
        .record(elapsed.as_secs_f64() * 1_000.0, &attrs[..1]);
}

pub fn record_retry(agent_type: AgentType) {
    handles()
        .retries
        .add(1, &[KeyValue::new("agent_type", agent_type.as_str())]);
}

pub fn record_workflow_outcome(outcome: &str) {
    handles()
        .workflows
        .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}
