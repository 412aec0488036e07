//! Listener list with phase-closure bits.
//!
//! Every job with more than one observer keeps its listeners in a
//! [`NodeList`]: an insertion-ordered list supporting append, logical
//! removal, and *phase closure*. Closing a phase bit atomically rejects any
//! later append that requires the bit to be clear, which is how the
//! notification phases seal themselves against stragglers:
//!
//! - [`CLOSED_FOR_CANCELLATION`] is set right before cancellation listeners
//!   are notified.
//! - [`CLOSED_FOR_CHILDREN`] is set once the completing job has stopped
//!   accepting new children to wait for.
//! - [`CLOSED_FOR_COMPLETION`] is set right before terminal listeners are
//!   notified.
//!
//! Appends and closes are linearized on the list's internal lock; traversal
//! works on an ordered snapshot and elides removed nodes, so listeners are
//! never invoked under any lock.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::cause::Cause;
use crate::job::Job;

/// Closed for terminal-phase notification; nothing may be appended anymore.
pub(crate) const CLOSED_FOR_COMPLETION: u8 = 1 << 0;
/// Closed for new children; late arrivals are no longer awaited.
pub(crate) const CLOSED_FOR_CHILDREN: u8 = 1 << 1;
/// Closed for cancellation-phase notification.
pub(crate) const CLOSED_FOR_CANCELLATION: u8 = 1 << 2;

/// What a list entry does when its phase fires.
pub(crate) enum NodeKind {
    /// A user-supplied completion or cancellation handler.
    Handler(Box<dyn Fn(Option<&Cause>) + Send + Sync>),
    /// An attached child; invocation delivers the parent-cancelled signal.
    Child(Job),
}

/// One registered listener.
///
/// Nodes are invoked at most once across their lifetime: the `invoked` flag
/// is claimed with a swap, so a node that fired in the cancelling phase is
/// skipped by the terminal traversal.
pub(crate) struct Node {
    on_cancelling: bool,
    invoked: AtomicBool,
    removed: AtomicBool,
    /// Append order within the owning list; assigned once on insert.
    seq: AtomicU64,
    kind: NodeKind,
}

impl Node {
    pub(crate) fn handler(
        on_cancelling: bool,
        f: impl Fn(Option<&Cause>) + Send + Sync + 'static,
    ) -> Self {
        Self::new(on_cancelling, NodeKind::Handler(Box::new(f)))
    }

    /// Child entries fire in the cancelling phase.
    pub(crate) fn child(job: Job) -> Self {
        Self::new(true, NodeKind::Child(job))
    }

    fn new(on_cancelling: bool, kind: NodeKind) -> Self {
        Self {
            on_cancelling,
            invoked: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            seq: AtomicU64::new(u64::MAX),
            kind,
        }
    }

    pub(crate) fn is_on_cancelling(&self) -> bool {
        self.on_cancelling
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn is_child(&self) -> bool {
        matches!(self.kind, NodeKind::Child(_))
    }

    pub(crate) fn child_job(&self) -> Option<&Job> {
        match &self.kind {
            NodeKind::Child(job) => Some(job),
            NodeKind::Handler(_) => None,
        }
    }

    fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Fires the node once. Later calls and calls on removed nodes are no-ops.
    pub(crate) fn invoke(&self, cause: Option<&Cause>) {
        if self.is_removed() {
            return;
        }
        if self.invoked.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.kind {
            NodeKind::Handler(f) => f(cause),
            NodeKind::Child(job) => job.parent_cancelled(cause),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("on_cancelling", &self.on_cancelling)
            .field("child", &self.is_child())
            .field("invoked", &self.invoked.load(Ordering::Relaxed))
            .field("removed", &self.removed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Insertion-ordered listener list with phase-closure bits.
#[derive(Debug)]
pub(crate) struct NodeList {
    closed: AtomicU8,
    next_seq: AtomicU64,
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl NodeList {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicU8::new(0),
            next_seq: AtomicU64::new(0),
            nodes: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Node>>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends `node` unless any of `forbidden` bits are already closed.
    ///
    /// Returns false when the append was rejected; the node is untouched and
    /// may be retried with weaker requirements.
    pub(crate) fn append(&self, node: &Arc<Node>, forbidden: u8) -> bool {
        let mut nodes = self.lock();
        if self.closed.load(Ordering::Acquire) & forbidden != 0 {
            return false;
        }
        node.seq
            .store(self.next_seq.fetch_add(1, Ordering::AcqRel), Ordering::Release);
        nodes.push(Arc::clone(node));
        true
    }

    /// Closes the given phase bits. Linearized with [`append`](Self::append).
    pub(crate) fn close(&self, bits: u8) {
        let _nodes = self.lock();
        self.closed.fetch_or(bits, Ordering::AcqRel);
    }

    pub(crate) fn is_closed_for(&self, bits: u8) -> bool {
        self.closed.load(Ordering::Acquire) & bits != 0
    }

    /// Unlinks the node in place. Safe to call for nodes that were never
    /// appended or were already unlinked.
    pub(crate) fn remove(&self, node: &Arc<Node>) {
        let mut nodes = self.lock();
        nodes.retain(|n| !Arc::ptr_eq(n, node));
    }

    /// Ordered snapshot of live nodes for lock-free traversal.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Node>> {
        self.lock().iter().map(Arc::clone).collect()
    }

    /// The next live child entry appended after `prev` (or from the start).
    ///
    /// Ordering is by append sequence, so the walk stays monotonic even when
    /// `prev` has already been unlinked.
    pub(crate) fn next_child_after(&self, prev: Option<&Arc<Node>>) -> Option<Arc<Node>> {
        let floor = prev.map_or(0, |n| n.seq().saturating_add(1));
        self.lock()
            .iter()
            .filter(|n| n.is_child() && !n.is_removed() && n.seq() >= floor)
            .min_by_key(|n| n.seq())
            .map(Arc::clone)
    }

    /// Snapshot of the jobs behind the live child entries.
    pub(crate) fn children(&self) -> Vec<Job> {
        self.lock()
            .iter()
            .filter(|n| !n.is_removed())
            .filter_map(|n| n.child_job().cloned())
            .collect()
    }
}
