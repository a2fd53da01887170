//! Hierarchical execution-context identity.
//!
//! Every top-level invocation owns one [`ContextStack`]. Nested agent-as-tool
//! calls push a child frame whose id is derived from its parent
//! (`{parent}.{agent_type}.{n}`), so lineage can be recovered from the id
//! string alone. The stack is bound to the running task with a tokio task
//! local; concurrent siblings run on [`fork`]ed copies so their push/pop
//! sequences never interleave on one stack.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ContextError;

/// Opaque identifier of one logical execution.
pub type ContextId = String;

/// Context id used when a caller does not supply one.
pub const ROOT_CONTEXT_ID: &str = "root";

tokio::task_local! {
    static CURRENT_STACK: RefCell<ContextStack>;
}

/// One entry on the context stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFrame {
    pub id: ContextId,
    pub parent_id: Option<ContextId>,
    pub depth: usize,
}

impl ContextFrame {
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }
}

/// State shared by a stack and all of its forks within one invocation.
#[derive(Debug, Default)]
struct InvocationShared {
    issued: DashSet<ContextId>,
    children: DashMap<ContextId, u64>,
    poisoned: AtomicBool,
}

/// Per-invocation stack of execution contexts.
#[derive(Debug, Clone, Default)]
pub struct ContextStack {
    frames: Vec<ContextFrame>,
    shared: Arc<InvocationShared>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh stack with `root_id` as its only frame.
    pub fn with_root(root_id: impl Into<ContextId>) -> Self {
        let mut stack = Self::new();
        // A fresh stack has issued nothing, so the root push cannot collide.
        let _ = stack.push(root_id);
        stack
    }

    /// Push `id` on top of the stack and return its depth.
    pub fn push(&mut self, id: impl Into<ContextId>) -> Result<usize, ContextError> {
        let id = id.into();
        if !self.shared.issued.insert(id.clone()) {
            return Err(ContextError::DuplicateId(id));
        }
        let depth = self.frames.len();
        let parent_id = self.frames.last().map(|frame| frame.id.clone());
        self.frames.push(ContextFrame {
            id,
            parent_id,
            depth,
        });
        Ok(depth)
    }

    /// Derive the next child id of the current frame and push it.
    pub fn push_child(&mut self, agent_type: &str) -> Result<ContextFrame, ContextError> {
        loop {
            let id = self.next_child_id(agent_type)?;
            match self.push(id) {
                Ok(_) => return self.current().cloned().ok_or(ContextError::EmptyStack),
                Err(ContextError::DuplicateId(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Pop the top frame. Popping an empty stack is an imbalance and poisons
    /// the invocation.
    pub fn pop(&mut self) -> Result<ContextFrame, ContextError> {
        match self.frames.pop() {
            Some(frame) => Ok(frame),
            None => {
                self.poison();
                Err(ContextError::EmptyStack)
            }
        }
    }

    /// Pop the top frame only if it is `expected`.
    pub fn pop_expected(&mut self, expected: &str) -> Result<ContextFrame, ContextError> {
        match self.frames.last() {
            Some(top) if top.id == expected => self.pop(),
            top => {
                let found = top.map(|frame| frame.id.clone());
                self.poison();
                Err(ContextError::Imbalance {
                    expected: expected.to_string(),
                    found,
                })
            }
        }
    }

    pub fn current(&self) -> Option<&ContextFrame> {
        self.frames.last()
    }

    /// Depth of the current frame; `None` when the stack is empty.
    pub fn depth(&self) -> Option<usize> {
        self.current().map(|frame| frame.depth)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::SeqCst)
    }

    fn poison(&self) {
        self.shared.poisoned.store(true, Ordering::SeqCst);
    }

    fn next_child_id(&self, agent_type: &str) -> Result<ContextId, ContextError> {
        let parent = self.current().ok_or(ContextError::EmptyStack)?;
        let counter = {
            let mut entry = self.shared.children.entry(parent.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        Ok(format!("{}.{agent_type}.{counter}", parent.id))
    }
}

/// Parent id encoded in a derived child id, if any.
pub fn lineage_parent(id: &str) -> Option<&str> {
    let mut parts = id.rsplitn(3, '.');
    let counter = parts.next()?;
    let _agent_type = parts.next()?;
    let parent = parts.next()?;
    counter.parse::<u64>().ok().map(|_| parent)
}

/// Whether `id` is `ancestor` itself or one of its descendants.
pub fn is_within(id: &str, ancestor: &str) -> bool {
    id == ancestor
        || id
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Run `fut` as a new top-level invocation rooted at `root_id`.
pub async fn with_root<F>(root_id: impl Into<ContextId>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_STACK
        .scope(RefCell::new(ContextStack::with_root(root_id)), fut)
        .await
}

/// Run `fut` on a copy of the current stack. Forks share id counters and the
/// poison flag with their origin, so ids stay unique across siblings.
pub async fn fork<F>(fut: F) -> F::Output
where
    F: Future,
{
    match CURRENT_STACK.try_with(|stack| stack.borrow().clone()) {
        Ok(snapshot) => CURRENT_STACK.scope(RefCell::new(snapshot), fut).await,
        Err(_) => fut.await,
    }
}

/// Current frame of the ambient stack.
pub fn current() -> Option<ContextFrame> {
    CURRENT_STACK
        .try_with(|stack| stack.borrow().current().cloned())
        .ok()
        .flatten()
}

pub fn is_poisoned() -> bool {
    CURRENT_STACK
        .try_with(|stack| stack.borrow().is_poisoned())
        .unwrap_or(false)
}

/// Push a child context for `agent_type` on the ambient stack. The returned
/// guard pops it again when dropped, whatever the exit path.
pub fn enter(agent_type: &str) -> Result<ContextGuard, ContextError> {
    let frame = CURRENT_STACK
        .try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.is_poisoned() {
                return Err(ContextError::Poisoned);
            }
            stack.push_child(agent_type)
        })
        .map_err(|_| ContextError::Unbound)??;
    Ok(ContextGuard { frame })
}

/// Scoped ownership of one pushed frame.
#[derive(Debug)]
#[must_use = "dropping the guard pops the context immediately"]
pub struct ContextGuard {
    frame: ContextFrame,
}

impl ContextGuard {
    pub fn frame(&self) -> &ContextFrame {
        &self.frame
    }

    pub fn id(&self) -> &str {
        &self.frame.id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let popped =
            CURRENT_STACK.try_with(|stack| stack.borrow_mut().pop_expected(&self.frame.id));
        match popped {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(
                context_id = %self.frame.id,
                error = %err,
                "context stack imbalance"
            ),
            Err(_) => error!(
                context_id = %self.frame.id,
                "context guard dropped outside of its invocation"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_sequences_restore_depth() {
        let mut stack = ContextStack::with_root("root");
        assert_eq!(stack.depth(), Some(0));

        let first = stack.push_child("web_research").unwrap();
        assert_eq!(first.depth, 1);
        let second = stack.push_child("analysis").unwrap();
        assert_eq!(second.depth, 2);
        assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));

        stack.pop().unwrap();
        stack.pop().unwrap();
        assert_eq!(stack.depth(), Some(0));
        assert!(!stack.is_poisoned());
    }

    #[test]
    fn pop_without_push_is_rejected() {
        let mut stack = ContextStack::new();
        assert_eq!(stack.pop(), Err(ContextError::EmptyStack));
        assert!(stack.is_poisoned());
    }

    #[test]
    fn out_of_order_pop_poisons_stack() {
        let mut stack = ContextStack::with_root("root");
        let child = stack.push_child("synthesis").unwrap();
        let err = stack.pop_expected("root").unwrap_err();
        assert_eq!(
            err,
            ContextError::Imbalance {
                expected: "root".into(),
                found: Some(child.id),
            }
        );
        assert!(stack.is_poisoned());
    }

    #[test]
    fn child_ids_encode_lineage_and_never_repeat() {
        let mut stack = ContextStack::with_root("root");
        let a = stack.push_child("web_research").unwrap();
        stack.pop().unwrap();
        let b = stack.push_child("web_research").unwrap();

        assert_eq!(a.id, "root.web_research.1");
        assert_eq!(b.id, "root.web_research.2");
        assert_eq!(lineage_parent(&b.id), Some("root"));
        assert_eq!(lineage_parent("root"), None);
        assert!(stack.push("root.web_research.1").is_err());
    }

    #[test]
    fn lineage_matching_respects_segment_boundaries() {
        assert!(is_within("root.analysis.1", "root"));
        assert!(is_within("root", "root"));
        assert!(!is_within("rooted.analysis.1", "root"));
        assert!(!is_within("root", "root.analysis.1"));
    }

    #[tokio::test]
    async fn guard_pops_on_every_exit_path() {
        with_root("root", async {
            {
                let guard = enter("decomposition").unwrap();
                assert_eq!(current().unwrap().id, guard.id());
                assert_eq!(current().unwrap().depth, 1);
            }
            assert_eq!(current().unwrap().id, "root");

            let failed: Result<(), ContextError> = (|| {
                let _guard = enter("analysis")?;
                Err(ContextError::EmptyStack)
            })();
            assert!(failed.is_err());
            assert_eq!(current().unwrap().depth, 0);
            assert!(!is_poisoned());
        })
        .await;
    }

    #[tokio::test]
    async fn enter_outside_invocation_is_unbound() {
        assert_eq!(enter("analysis").unwrap_err(), ContextError::Unbound);
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn forks_are_isolated_but_share_counters() {
        with_root("root", async {
            let (left, right) = tokio::join!(
                fork(async {
                    let guard = enter("web_research").unwrap();
                    tokio::task::yield_now().await;
                    current().map(|frame| (frame, guard.id().to_string()))
                }),
                fork(async {
                    let guard = enter("web_research").unwrap();
                    tokio::task::yield_now().await;
                    current().map(|frame| (frame, guard.id().to_string()))
                }),
            );
            let (left, left_id) = left.unwrap();
            let (right, right_id) = right.unwrap();
            assert_eq!(left.id, left_id);
            assert_eq!(right.id, right_id);
            assert_ne!(left.id, right.id);
            assert_eq!(current().unwrap().id, "root");
            assert!(!is_poisoned());
        })
        .await;
    }
}
