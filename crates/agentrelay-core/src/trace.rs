use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::ContextId;
use crate::dispatch::{DispatchEnvelope, PayloadEvent, Subscriber};

/// Subscriber-side record of every envelope delivered during an invocation.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeTrace {
    envelopes: Arc<Mutex<Vec<DispatchEnvelope>>>,
}

impl EnvelopeTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that appends to this trace; clones share the same record.
    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::new(self.clone())
    }

    pub fn record(&self, envelope: DispatchEnvelope) {
        if let Ok(mut envelopes) = self.envelopes.lock() {
            envelopes.push(envelope);
        }
    }

    pub fn envelopes(&self) -> Vec<DispatchEnvelope> {
        self.envelopes
            .lock()
            .map(|envelopes| envelopes.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes published from one context, in publish order.
    pub fn for_context(&self, context_id: &str) -> Vec<DispatchEnvelope> {
        self.envelopes()
            .into_iter()
            .filter(|envelope| envelope.context_id == context_id)
            .collect()
    }

    /// Distinct contexts in first-seen order.
    pub fn contexts(&self) -> Vec<TraceNode> {
        self.summary().nodes
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_envelopes(&self.envelopes())
    }
}

#[async_trait]
impl Subscriber for EnvelopeTrace {
    async fn deliver(&self, envelope: &DispatchEnvelope) -> anyhow::Result<()> {
        self.envelopes
            .lock()
            .map_err(|_| anyhow::anyhow!("trace buffer poisoned"))?
            .push(envelope.clone());
        Ok(())
    }
}

/// One context frame seen in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    pub context_id: ContextId,
    pub parent_context_id: Option<ContextId>,
    pub depth: usize,
    pub envelopes: usize,
    /// Agent type encoded in the context id; `None` for the root.
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub nodes: Vec<TraceNode>,
    pub errors: Vec<String>,
}

impl TraceSummary {
    pub fn from_envelopes(envelopes: &[DispatchEnvelope]) -> Self {
        let mut nodes: Vec<TraceNode> = Vec::new();
        let mut errors = Vec::new();

        for envelope in envelopes {
            let index = match nodes
                .iter()
                .position(|node| node.context_id == envelope.context_id)
            {
                Some(index) => index,
                None => {
                    nodes.push(TraceNode {
                        context_id: envelope.context_id.clone(),
                        parent_context_id: envelope.parent_context_id.clone(),
                        depth: envelope.depth,
                        envelopes: 0,
                        label: None,
                    });
                    nodes.len() - 1
                }
            };
            nodes[index].envelopes += 1;
            if let Some(PayloadEvent::Error { message }) = &envelope.payload.event {
                errors.push(format!("{}: {message}", envelope.context_id));
            }
        }

        for node in &mut nodes {
            if let Some(agent) = node
                .context_id
                .rsplit('.')
                .nth(1)
                .filter(|_| node.parent_context_id.is_some())
            {
                node.label = Some(agent.to_string());
            }
        }

        Self { nodes, errors }
    }

    pub fn render_markdown(&self) -> String {
        if self.nodes.is_empty() {
            return "No envelopes recorded.".to_string();
        }
        let mut output = String::from("### Context Trace\n");
        for node in &self.nodes {
            let indent = "  ".repeat(node.depth);
            let _ = writeln!(
                output,
                "{indent}- `{}` ({} envelope{})",
                node.context_id,
                node.envelopes,
                if node.envelopes == 1 { "" } else { "s" }
            );
        }
        if !self.errors.is_empty() {
            output.push_str("\n**Errors**\n");
            for error in &self.errors {
                let _ = writeln!(output, "- {error}");
            }
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.nodes.is_empty() {
            return "flowchart TD\n  %% no envelopes captured\n".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for (idx, node) in self.nodes.iter().enumerate() {
            let label = match &node.label {
                Some(agent) => format!("{agent}<br/>{}", node.context_id),
                None => node.context_id.clone(),
            };
            let _ = writeln!(output, "  ctx{idx}[\"{}\"]", sanitize_mermaid(&label));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let parent = node.parent_context_id.as_deref().and_then(|parent| {
                self.nodes
                    .iter()
                    .position(|candidate| candidate.context_id == parent)
            });
            if let Some(parent) = parent {
                let _ = writeln!(output, "  ctx{parent} --> ctx{idx}");
            }
        }
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('"', "'")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}
