//! Binding an outward consumer to one top-level invocation.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::dispatch::{self, Dispatcher, Subscriber, SubscriptionFilter};
use crate::error::DispatchError;

/// Creates a fresh dispatcher, binds it as the ambient dispatcher for the
/// wrapped future and subscribes the consumer. On exit, whether the future
/// completes, panics or is dropped, the consumer is unsubscribed and the
/// dispatcher torn down.
pub struct SubscriptionScope {
    handler: Arc<dyn Subscriber>,
    filter: SubscriptionFilter,
}

impl SubscriptionScope {
    pub fn new(handler: Arc<dyn Subscriber>) -> Self {
        Self {
            handler,
            filter: SubscriptionFilter::all(),
        }
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub async fn run<F>(self, fut: F) -> Result<F::Output, DispatchError>
    where
        F: Future,
    {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.bind()?;
        let teardown = Teardown(Arc::clone(&dispatcher));
        let subscription = dispatcher.subscription(self.handler, self.filter)?;

        let output = dispatch::bind_ambient(Arc::clone(&dispatcher), fut).await;

        // Everything published by the invocation reaches the consumer before
        // the scope returns.
        dispatcher.flush().await;
        drop(subscription);
        drop(teardown);
        Ok(output)
    }
}

struct Teardown(Arc<Dispatcher>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.reset();
        debug!("subscription scope closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use crate::dispatch::{
        DispatchEnvelope, DomainPayload, SyncHandler, current_dispatcher, publish,
    };
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn scope_binds_and_releases_the_dispatcher() {
        let (sink, mut rx) = mpsc::unbounded_channel::<DispatchEnvelope>();
        let captured = SubscriptionScope::new(Arc::new(sink))
            .run(context::with_root("root", async {
                let dispatcher = current_dispatcher().expect("bound inside scope");
                assert_eq!(dispatcher.subscriber_count(), 1);
                publish(DomainPayload::text("hello"));
                dispatcher
            }))
            .await
            .unwrap();

        assert_eq!(captured.subscriber_count(), 0);
        assert_eq!(captured.publish(DomainPayload::text("late")), 0);
        assert!(current_dispatcher().is_none());
        assert_eq!(rx.recv().await.unwrap().payload.content.as_deref(), Some("hello"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failing_invocation_still_leaves_zero_subscribers() {
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);

        let outcome = AssertUnwindSafe(SubscriptionScope::new(SyncHandler::shared(
            |_: &DispatchEnvelope| Ok(()),
        ))
        .run(async move {
            let dispatcher = current_dispatcher();
            let bound = dispatcher.is_some();
            *slot.lock().unwrap() = dispatcher;
            if bound {
                panic!("invocation blew up");
            }
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        let dispatcher = seen.lock().unwrap().take().unwrap();
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn nested_agent_call_is_tagged_as_child_of_root() {
        let (sink, mut rx) = mpsc::unbounded_channel::<DispatchEnvelope>();
        SubscriptionScope::new(Arc::new(sink))
            .run(context::with_root("root", async {
                publish(DomainPayload::text("planning"));
                let _tool = context::enter("web_research").unwrap();
                publish(DomainPayload::text("searching"));
                publish(DomainPayload::thinking("comparing sources"));
            }))
            .await
            .unwrap();

        let mut envelopes = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            envelopes.push(envelope);
        }
        let children: Vec<_> = envelopes.iter().filter(|e| e.context_id != "root").collect();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|e| e.depth == 1));
        assert!(
            children
                .iter()
                .all(|e| e.parent_context_id.as_deref() == Some("root"))
        );
        assert_eq!(envelopes.iter().filter(|e| e.depth == 0).count(), 1);
    }

    #[tokio::test]
    async fn concurrent_invocations_do_not_share_dispatchers() {
        let (left_sink, mut left_rx) = mpsc::unbounded_channel::<DispatchEnvelope>();
        let (right_sink, mut right_rx) = mpsc::unbounded_channel::<DispatchEnvelope>();

        let left = SubscriptionScope::new(Arc::new(left_sink)).run(context::with_root(
            "left",
            async {
                tokio::task::yield_now().await;
                publish(DomainPayload::text("from left"));
            },
        ));
        let right = SubscriptionScope::new(Arc::new(right_sink)).run(context::with_root(
            "right",
            async {
                publish(DomainPayload::text("from right"));
                tokio::task::yield_now().await;
            },
        ));
        let (l, r) = tokio::join!(left, right);
        l.unwrap();
        r.unwrap();

        let left_env = left_rx.try_recv().unwrap();
        let right_env = right_rx.try_recv().unwrap();
        assert_eq!(left_env.context_id, "left");
        assert_eq!(right_env.context_id, "right");
        assert!(left_rx.try_recv().is_err());
        assert!(right_rx.try_recv().is_err());
    }
}
