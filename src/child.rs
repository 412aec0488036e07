//! Parent/child handles and listener disposal.
//!
//! Attachment wires the tree in both directions: the parent's listener list
//! gains a child entry, and the child keeps the returned [`ChildHandle`] as
//! its back-edge for upward failure propagation. Both edges are strong
//! handles; the cycle is broken proactively when the child reaches terminal
//! and disposes its parent handle, unlinking the entry from the parent's
//! list.

use std::sync::Arc;

use crate::cause::Cause;
use crate::job::Job;
use crate::list::Node;

/// A registered completion or cancellation listener.
///
/// Returned by [`Job::invoke_on_completion`]. Disposal unlinks the listener
/// and is idempotent; disposing after the listener fired does nothing.
/// Handles for listeners that were never registered (the job was already
/// terminal) are inert.
#[derive(Debug)]
pub struct Disposable {
    inner: Option<(Job, Arc<Node>)>,
}

impl Disposable {
    pub(crate) fn attached(job: Job, node: Arc<Node>) -> Self {
        Self {
            inner: Some((job, node)),
        }
    }

    pub(crate) fn sentinel() -> Self {
        Self { inner: None }
    }

    /// True when the listener actually sits in a job's list.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    /// Unlinks the listener so it never fires. Idempotent.
    pub fn dispose(&self) {
        if let Some((job, node)) = &self.inner {
            job.core().remove_node(node);
        }
    }
}

/// The handle a child holds onto its parent.
///
/// Carries both the entry in the parent's listener list (for disposal) and
/// the parent reference used to report the child's failure upward. Clones
/// refer to the same registration.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    parent: Option<Job>,
    node: Option<Arc<Node>>,
}

impl ChildHandle {
    pub(crate) fn attached(parent: Job, node: Arc<Node>) -> Self {
        Self {
            parent: Some(parent),
            node: Some(node),
        }
    }

    /// The non-disposable handle returned when the parent was already
    /// terminal at attach time.
    pub(crate) fn sentinel() -> Self {
        Self {
            parent: None,
            node: None,
        }
    }

    /// True when the child is actually linked into the parent's list.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.node.is_some()
    }

    pub(crate) fn parent(&self) -> Option<&Job> {
        self.parent.as_ref()
    }

    /// Unlinks the child entry from the parent's list. Idempotent.
    pub fn dispose(&self) {
        if let (Some(parent), Some(node)) = (&self.parent, &self.node) {
            parent.core().remove_node(node);
        }
    }

    /// Reports the child's cause to the parent; returns whether the parent
    /// took responsibility for it.
    pub(crate) fn child_cancelled(&self, cause: &Cause) -> bool {
        match &self.parent {
            Some(parent) => parent.core().child_cancelled(cause),
            None => false,
        }
    }
}
