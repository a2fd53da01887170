//! Context-tagged event dispatch for one top-level invocation.
//!
//! Anything running inside an invocation can call [`publish`] without being
//! handed a channel: the payload is wrapped in a [`DispatchEnvelope`] carrying
//! the current context frame and queued to every subscriber of the ambient
//! [`Dispatcher`]. Each subscriber drains its own FIFO queue on a separate
//! task, so publishing never waits for a handler, events from one context
//! arrive in publish order, and a failing handler only affects itself.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::{fmt, future::Future};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::context::{self, ContextFrame, ContextId};
use crate::error::DispatchError;

tokio::task_local! {
    static CURRENT_DISPATCHER: Arc<Dispatcher>;
}

/// One attachment carried by a payload. Binary content is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub content_type: String,
    pub content: String,
}

impl DataItem {
    pub fn text(content_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content: text.into(),
        }
    }

    pub fn binary(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            content: BASE64.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.content.as_bytes())
    }
}

/// Discrete notices carried alongside incremental content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadEvent {
    /// A tool (or agent-as-tool) is being invoked. Arguments are never included.
    ToolCall { name: String },
    /// The invocation terminated with a failure.
    Error { message: String },
}

/// The domain data being propagated. All fields are optional; an empty
/// payload is valid and can be ignored by consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<PayloadEvent>,
}

impl DomainPayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self {
            thinking: Some(thinking.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(name: impl Into<String>) -> Self {
        Self {
            event: Some(PayloadEvent::ToolCall { name: name.into() }),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: Some(PayloadEvent::Error {
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, item: DataItem) -> Self {
        self.data.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.thinking.is_none()
            && self.data.is_empty()
            && self.event.is_none()
    }
}

/// A payload tagged with the context that published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub context_id: ContextId,
    pub parent_context_id: Option<ContextId>,
    pub depth: usize,
    #[serde(flatten)]
    pub payload: DomainPayload,
}

impl DispatchEnvelope {
    pub fn new(frame: &ContextFrame, payload: DomainPayload) -> Self {
        Self {
            context_id: frame.id.clone(),
            parent_context_id: frame.parent_id.clone(),
            depth: frame.depth,
            payload,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.depth == 0
    }
}

/// Receiver of dispatched envelopes.
///
/// The publisher treats every subscriber the same way; whether a handler is
/// a plain function or a future is decided by the implementation.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, envelope: &DispatchEnvelope) -> anyhow::Result<()>;
}

/// Subscriber backed by a synchronous function.
pub struct SyncHandler<F> {
    handler: F,
}

impl<F> SyncHandler<F>
where
    F: Fn(&DispatchEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }

    pub fn shared(handler: F) -> Arc<dyn Subscriber> {
        Arc::new(Self::new(handler))
    }
}

#[async_trait]
impl<F> Subscriber for SyncHandler<F>
where
    F: Fn(&DispatchEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn deliver(&self, envelope: &DispatchEnvelope) -> anyhow::Result<()> {
        (self.handler)(envelope)
    }
}

/// Subscriber backed by a function returning a future.
pub struct AsyncHandler<F> {
    handler: F,
}

impl<F, Fut> AsyncHandler<F>
where
    F: Fn(DispatchEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }

    pub fn shared(handler: F) -> Arc<dyn Subscriber> {
        Arc::new(Self::new(handler))
    }
}

#[async_trait]
impl<F, Fut> Subscriber for AsyncHandler<F>
where
    F: Fn(DispatchEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn deliver(&self, envelope: &DispatchEnvelope) -> anyhow::Result<()> {
        (self.handler)(envelope.clone()).await
    }
}

/// Outward stream sink: forwards envelopes into a channel.
#[async_trait]
impl Subscriber for mpsc::UnboundedSender<DispatchEnvelope> {
    async fn deliver(&self, envelope: &DispatchEnvelope) -> anyhow::Result<()> {
        self.send(envelope.clone())
            .map_err(|_| anyhow::anyhow!("envelope stream receiver dropped"))
    }
}

/// Restricts which envelopes a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub max_depth: Option<usize>,
    pub lineage: Option<ContextId>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn within(mut self, ancestor: impl Into<ContextId>) -> Self {
        self.lineage = Some(ancestor.into());
        self
    }

    pub fn accepts(&self, envelope: &DispatchEnvelope) -> bool {
        let depth_ok = self.max_depth.is_none_or(|max| envelope.depth <= max);
        let lineage_ok = self
            .lineage
            .as_deref()
            .is_none_or(|ancestor| context::is_within(&envelope.context_id, ancestor));
        depth_ok && lineage_ok
    }
}

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Lifecycle of a dispatcher: `Unbound -> Bound -> TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Unbound,
    Bound,
    TornDown,
}

impl DispatcherState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => DispatcherState::Unbound,
            1 => DispatcherState::Bound,
            _ => DispatcherState::TornDown,
        }
    }
}

enum Delivery {
    Envelope(Arc<DispatchEnvelope>),
    Flush(oneshot::Sender<()>),
}

struct SubscriberSlot {
    queue: mpsc::UnboundedSender<Delivery>,
    filter: SubscriptionFilter,
}

/// Subscriber set for a single top-level invocation.
pub struct Dispatcher {
    subscribers: DashMap<SubscriptionToken, SubscriberSlot>,
    next_token: AtomicU64,
    state: AtomicU8,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_token: AtomicU64::new(1),
            state: AtomicU8::new(0),
        }
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Make publishing live. Only valid from `Unbound`.
    pub fn bind(&self) -> Result<(), DispatchError> {
        match self
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(1) => Err(DispatchError::AlreadyBound),
            Err(_) => Err(DispatchError::TornDown),
        }
    }

    /// Register `handler` and start its delivery task. Only valid while
    /// `Bound`. Requires a tokio runtime.
    pub fn subscribe(
        &self,
        handler: Arc<dyn Subscriber>,
        filter: SubscriptionFilter,
    ) -> Result<SubscriptionToken, DispatchError> {
        match self.state() {
            DispatcherState::Bound => {}
            DispatcherState::Unbound => return Err(DispatchError::NotBound),
            DispatcherState::TornDown => return Err(DispatchError::TornDown),
        }

        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let (queue, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .insert(token, SubscriberSlot { queue, filter });

        // reset() may have raced with the insert above
        if self.state() == DispatcherState::TornDown {
            self.subscribers.remove(&token);
            return Err(DispatchError::TornDown);
        }

        tokio::spawn(drain_queue(token, handler, receiver));
        debug!(%token, "subscriber registered");
        Ok(token)
    }

    /// Remove a subscriber. Unknown tokens are ignored. Envelopes already
    /// queued for it are still delivered.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if self.subscribers.remove(&token).is_some() {
            debug!(%token, "subscriber removed");
        }
    }

    /// Subscribe for the lifetime of the returned guard.
    pub fn subscription(
        self: &Arc<Self>,
        handler: Arc<dyn Subscriber>,
        filter: SubscriptionFilter,
    ) -> Result<Subscription, DispatchError> {
        let token = self.subscribe(handler, filter)?;
        Ok(Subscription {
            dispatcher: Arc::clone(self),
            token,
        })
    }

    /// Publish `payload` tagged with the ambient context. Returns how many
    /// subscribers it was queued for; zero when the dispatcher is not bound
    /// or no context is active.
    pub fn publish(&self, payload: DomainPayload) -> usize {
        match context::current() {
            Some(frame) => self.publish_envelope(DispatchEnvelope::new(&frame, payload)),
            None => {
                debug!("publish outside of any execution context dropped");
                0
            }
        }
    }

    fn publish_envelope(&self, envelope: DispatchEnvelope) -> usize {
        if self.state() != DispatcherState::Bound {
            return 0;
        }

        let envelope = Arc::new(envelope);
        let mut queued = 0;
        for slot in self.subscribers.iter() {
            if !slot.filter.accepts(&envelope) {
                continue;
            }
            if slot
                .queue
                .send(Delivery::Envelope(Arc::clone(&envelope)))
                .is_ok()
            {
                queued += 1;
            } else {
                warn!(token = %slot.key(), "subscriber queue closed; envelope dropped");
            }
        }
        queued
    }

    /// Wait until every envelope queued so far has been handled.
    pub async fn flush(&self) {
        let waiters: Vec<oneshot::Receiver<()>> = self
            .subscribers
            .iter()
            .filter_map(|slot| {
                let (done, waiter) = oneshot::channel();
                slot.queue.send(Delivery::Flush(done)).ok().map(|_| waiter)
            })
            .collect();

        for waiter in waiters {
            let _ = waiter.await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Tear a bound dispatcher down: drop every subscriber and make
    /// publishing a no-op. Terminal. An unbound dispatcher is left as it is,
    /// so it can still be bound later; a torn-down one stays torn down.
    pub fn reset(&self) {
        if self
            .state
            .compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.subscribers.clear();
            debug!("dispatcher torn down");
        }
    }
}

async fn drain_queue(
    token: SubscriptionToken,
    handler: Arc<dyn Subscriber>,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = receiver.recv().await {
        match delivery {
            Delivery::Envelope(envelope) => {
                match AssertUnwindSafe(handler.deliver(&envelope))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(
                        %token,
                        context_id = %envelope.context_id,
                        error = %err,
                        "subscriber failed to handle envelope"
                    ),
                    Err(_) => warn!(
                        %token,
                        context_id = %envelope.context_id,
                        "subscriber panicked while handling envelope"
                    ),
                }
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Guard that unsubscribes when dropped.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    dispatcher: Arc<Dispatcher>,
    token: SubscriptionToken,
}

impl Subscription {
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.token);
    }
}

/// Run `fut` with `dispatcher` as the ambient dispatcher.
pub(crate) async fn bind_ambient<F>(dispatcher: Arc<Dispatcher>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_DISPATCHER.scope(dispatcher, fut).await
}

/// Dispatcher bound to the running invocation, if any.
pub fn current_dispatcher() -> Option<Arc<Dispatcher>> {
    CURRENT_DISPATCHER.try_with(Arc::clone).ok()
}

/// Publish through the ambient dispatcher. Outside an invocation this is a
/// no-op returning zero.
pub fn publish(payload: DomainPayload) -> usize {
    CURRENT_DISPATCHER
        .try_with(|dispatcher| dispatcher.publish(payload))
        .unwrap_or(0)
}
