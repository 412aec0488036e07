//! The job state machine.
//!
//! A [`Job`] is a cancelable, observable unit of concurrent work arranged in
//! a parent/child tree. Cancellation propagates downward, failures propagate
//! upward, and a completing parent waits for every attached child before it
//! finalizes.
//!
//! # Core guarantees
//!
//! - Transitions are linearizable under concurrent mutation: every state
//!   change is a compare-and-swap on the job's state cell, retried on loss.
//! - Listeners fire at most once, in registration order, in one of two
//!   phases (cancelling, then terminal).
//! - A parent never reaches a terminal state before all of its children.
//! - Cancellations are "normal": they never surface as unhandled failures.
//!
//! # Locking
//!
//! Two locks exist per job: the state cell's and the finishing record's.
//! When both are needed the record's is taken first. Listener invocation and
//! parent upcalls always run with neither held, so listeners may freely call
//! back into the job.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::cause::{CancelKind, Cause, NotActiveError};
use crate::child::{ChildHandle, Disposable};
use crate::finishing::{BeginCompleting, Finishing, Recorded};
use crate::list::{
    Node, NodeList, CLOSED_FOR_CANCELLATION, CLOSED_FOR_CHILDREN, CLOSED_FOR_COMPLETION,
};
use crate::select::OnJoin;
use crate::state::{CompletionValue, JobState, Lifecycle, StateCell, Terminal};
use crate::wait::JoinFuture;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Debug identity of a job. Monotonic per process; used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw counter value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Hooks the state machine calls out to.
///
/// The core job is a concrete value; variants (plain job, supervisor,
/// deferred, or an embedding runtime's task) differ only in the hooks they
/// install. All methods have defaults, so an embedder overrides only what it
/// needs.
pub trait JobHooks: Send + Sync {
    /// Called exactly once when the job transitions from a not-started state
    /// to active.
    fn on_start(&self) {}

    /// Called exactly once per job: either when the cancelling phase begins
    /// (with the root cause) or during finalization when no cancelling phase
    /// ever ran (with the final cause, or `None` on normal completion).
    fn on_cancelling(&self, cause: Option<&Cause>) {
        let _ = cause;
    }

    /// Called once with the decided terminal state, right before it is
    /// installed.
    fn on_completion(&self, terminal: &Terminal) {
        let _ = terminal;
    }

    /// Last-resort handler for a failure no parent accepted. Returns whether
    /// the failure was handled.
    fn handle_job_exception(&self, cause: &Cause) -> bool {
        let _ = cause;
        false
    }

    /// Whether this job (or an ancestor) reports unhandled failures itself,
    /// making `handle_job_exception` on descendants unnecessary.
    fn handles_exception(&self) -> bool {
        true
    }

    /// When true, a cancellation drives the completing protocol directly:
    /// the job has no body to wait for, so `cancel` completes it. Pure job
    /// handles use this mode.
    fn on_cancel_complete(&self) -> bool {
        false
    }

    /// Scoped jobs rethrow failures to their caller instead of reporting
    /// them to a parent.
    fn is_scoped(&self) -> bool {
        false
    }

    /// Supervisor policy: when true, a child's failure is ignored instead of
    /// cancelling this job.
    fn ignores_child_failures(&self) -> bool {
        false
    }

    /// Receives the aggregate of panics raised by completion listeners
    /// during one notification pass. The job's own cause is unaffected.
    ///
    /// The default propagates the panic on the notifying thread.
    fn handle_listener_panic(&self, panic: Cause) {
        std::panic::panic_any(panic.to_string());
    }
}

impl<T: JobHooks + ?Sized> JobHooks for Arc<T> {
    fn on_start(&self) {
        (**self).on_start()
    }

    fn on_cancelling(&self, cause: Option<&Cause>) {
        (**self).on_cancelling(cause)
    }

    fn on_completion(&self, terminal: &Terminal) {
        (**self).on_completion(terminal)
    }

    fn handle_job_exception(&self, cause: &Cause) -> bool {
        (**self).handle_job_exception(cause)
    }

    fn handles_exception(&self) -> bool {
        (**self).handles_exception()
    }

    fn on_cancel_complete(&self) -> bool {
        (**self).on_cancel_complete()
    }

    fn is_scoped(&self) -> bool {
        (**self).is_scoped()
    }

    fn ignores_child_failures(&self) -> bool {
        (**self).ignores_child_failures()
    }

    fn handle_listener_panic(&self, panic: Cause) {
        (**self).handle_listener_panic(panic)
    }
}

/// Hooks for the plain job handles built by [`Job::new`] and
/// [`Job::supervisor`]: no body, so cancellation completes them.
struct BaseHooks {
    supervisor: bool,
}

impl JobHooks for BaseHooks {
    fn on_cancel_complete(&self) -> bool {
        true
    }

    fn handles_exception(&self) -> bool {
        false
    }

    fn ignores_child_failures(&self) -> bool {
        self.supervisor
    }
}

/// The value or cause a completion attempt proposes.
#[derive(Clone)]
pub(crate) enum Proposed {
    Value(Option<CompletionValue>),
    Failed(Cause),
}

impl Proposed {
    fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Failed(cause) => Some(cause),
            Self::Value(_) => None,
        }
    }

    fn value_cloned(&self) -> Option<CompletionValue> {
        match self {
            Self::Value(value) => value.clone(),
            Self::Failed(_) => None,
        }
    }
}

/// Outcome of a completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completing {
    /// Another completion already owns the job, or it is terminal.
    AlreadyDone,
    /// Completion is underway, waiting for children to finish.
    Waiting,
    /// The job reached a terminal state on this call.
    Finalized,
}

pub(crate) struct JobCore {
    id: JobId,
    cell: StateCell,
    parent_handle: Mutex<Option<ChildHandle>>,
    handles_exception: AtomicBool,
    hooks: Box<dyn JobHooks>,
}

impl JobCore {
    fn new(hooks: Box<dyn JobHooks>, active: bool) -> Self {
        let initial = if active { JobState::Active } else { JobState::New };
        let handles = hooks.handles_exception();
        Self {
            id: JobId::next(),
            cell: StateCell::new(initial),
            parent_handle: Mutex::new(None),
            handles_exception: AtomicBool::new(handles),
            hooks,
        }
    }

    fn as_job(self: &Arc<Self>) -> Job {
        Job {
            core: Arc::clone(self),
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.cell.lifecycle()
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        match self.cell.snapshot() {
            JobState::Completed(terminal) => Some(terminal),
            _ => None,
        }
    }

    // ---------------------------------------------------------------------
    // Parent handle cell
    // ---------------------------------------------------------------------

    fn parent_guard(&self) -> MutexGuard<'_, Option<ChildHandle>> {
        match self.parent_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_parent_handle(&self, handle: ChildHandle) {
        *self.parent_guard() = Some(handle);
    }

    /// Detaches this job from its parent's list. Runs once per terminal
    /// transition; later calls see an empty cell.
    fn dispose_parent_handle(&self) {
        let handle = self.parent_guard().take();
        if let Some(handle) = handle {
            handle.dispose();
        }
    }

    pub(crate) fn parent_job(&self) -> Option<Job> {
        self.parent_guard().as_ref().and_then(|h| h.parent().cloned())
    }

    fn handles_exception(&self) -> bool {
        self.handles_exception.load(Ordering::Acquire)
    }

    /// A plain job handle reports a failure only if some ancestor does.
    fn compute_handles_exception(&self) -> bool {
        let mut current = self.parent_job();
        while let Some(job) = current {
            if job.core().handles_exception() {
                return true;
            }
            current = job.core().parent_job();
        }
        false
    }

    // ---------------------------------------------------------------------
    // start
    // ---------------------------------------------------------------------

    pub(crate) fn start(self: &Arc<Self>) -> bool {
        loop {
            let state = self.cell.snapshot();
            let next = match &state {
                JobState::New => JobState::Active,
                JobState::Listed {
                    list,
                    active: false,
                } => JobState::Listed {
                    list: Arc::clone(list),
                    active: true,
                },
                _ => return false,
            };
            if self.cell.compare_and_set(&state, next) {
                trace!(job_id = %self.id, "job started");
                self.hooks.on_start();
                return true;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Listener registration
    // ---------------------------------------------------------------------

    /// Promotes empty/single states to a listed state. Returns the list when
    /// the state already carries one; `None` means the caller must retry on
    /// a fresh snapshot.
    fn get_or_promote_list(&self, state: &JobState) -> Option<Arc<NodeList>> {
        match state {
            JobState::New => {
                let list = Arc::new(NodeList::new());
                self.cell.compare_and_set(
                    state,
                    JobState::Listed {
                        list,
                        active: false,
                    },
                );
                None
            }
            JobState::Active => {
                let list = Arc::new(NodeList::new());
                self.cell
                    .compare_and_set(state, JobState::Listed { list, active: true });
                None
            }
            JobState::Single(node) => {
                let list = Arc::new(NodeList::new());
                list.append(node, 0);
                self.cell
                    .compare_and_set(state, JobState::Listed { list, active: true });
                None
            }
            JobState::Listed { list, .. } => Some(Arc::clone(list)),
            JobState::Finishing(finishing) => Some(Arc::clone(finishing.list())),
            JobState::Completed(_) => None,
        }
    }

    /// Registers a listener node per the phase rules. With
    /// `invoke_immediately`, a node that can no longer be registered for its
    /// phase is invoked synchronously with the relevant cause instead.
    pub(crate) fn invoke_on_completion_node(
        self: &Arc<Self>,
        node: Arc<Node>,
        invoke_immediately: bool,
    ) -> Disposable {
        loop {
            let state = self.cell.snapshot();
            match &state {
                JobState::Completed(terminal) => {
                    if invoke_immediately {
                        node.invoke(terminal.cause());
                    }
                    return Disposable::sentinel();
                }
                JobState::Active => {
                    if self
                        .cell
                        .compare_and_set(&state, JobState::Single(Arc::clone(&node)))
                    {
                        return Disposable::attached(self.as_job(), node);
                    }
                }
                JobState::New | JobState::Single(_) => {
                    let _ = self.get_or_promote_list(&state);
                }
                JobState::Listed { list, .. } => {
                    if self.try_append_listener(list, &node) {
                        return Disposable::attached(self.as_job(), node);
                    }
                }
                JobState::Finishing(finishing) => {
                    if node.is_on_cancelling() {
                        if let Some(root) = finishing.root_cause() {
                            // Cancellation already ran; this phase is over.
                            if invoke_immediately {
                                node.invoke(Some(&root));
                            }
                            return Disposable::sentinel();
                        }
                    }
                    if self.try_append_listener(finishing.list(), &node) {
                        return Disposable::attached(self.as_job(), node);
                    }
                }
            }
        }
    }

    fn try_append_listener(&self, list: &Arc<NodeList>, node: &Arc<Node>) -> bool {
        let forbidden = if node.is_on_cancelling() {
            CLOSED_FOR_CANCELLATION | CLOSED_FOR_COMPLETION
        } else {
            CLOSED_FOR_COMPLETION
        };
        list.append(node, forbidden)
    }

    pub(crate) fn remove_node(&self, node: &Arc<Node>) {
        node.mark_removed();
        loop {
            let state = self.cell.snapshot();
            match &state {
                JobState::Single(current) if Arc::ptr_eq(current, node) => {
                    if self.cell.compare_and_set(&state, JobState::Active) {
                        return;
                    }
                }
                _ => {
                    if let Some(list) = state.list() {
                        list.remove(node);
                    }
                    return;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Child attachment
    // ---------------------------------------------------------------------

    pub(crate) fn attach_child(self: &Arc<Self>, child: &Job) -> ChildHandle {
        let node = Arc::new(Node::child(child.clone()));
        loop {
            let state = self.cell.snapshot();
            match &state {
                JobState::Completed(terminal) => {
                    node.invoke(terminal.cause());
                    return ChildHandle::sentinel();
                }
                JobState::Active => {
                    if self
                        .cell
                        .compare_and_set(&state, JobState::Single(Arc::clone(&node)))
                    {
                        trace!(job_id = %self.id, child = %child.id(), "child attached");
                        return ChildHandle::attached(self.as_job(), node);
                    }
                }
                JobState::New | JobState::Single(_) => {
                    let _ = self.get_or_promote_list(&state);
                }
                JobState::Listed { list, .. } => {
                    match self.attach_into_list(list, &node, child) {
                        Some(handle) => return handle,
                        None => return self.refuse_child(&node),
                    }
                }
                JobState::Finishing(finishing) => {
                    match self.attach_into_list(finishing.list(), &node, child) {
                        Some(handle) => return handle,
                        None => return self.refuse_child(&node),
                    }
                }
            }
        }
    }

    fn attach_into_list(
        self: &Arc<Self>,
        list: &Arc<NodeList>,
        node: &Arc<Node>,
        child: &Job,
    ) -> Option<ChildHandle> {
        if list.append(
            node,
            CLOSED_FOR_CANCELLATION | CLOSED_FOR_CHILDREN | CLOSED_FOR_COMPLETION,
        ) {
            trace!(job_id = %self.id, child = %child.id(), "child attached");
            return Some(ChildHandle::attached(self.as_job(), Arc::clone(node)));
        }
        // Cancellation has begun. The child can still join the wait set so
        // the parent does not finalize under it, but it learns the cause
        // right away.
        if list.append(node, CLOSED_FOR_CHILDREN | CLOSED_FOR_COMPLETION) {
            let cause = self.current_cancel_cause();
            trace!(job_id = %self.id, child = %child.id(), "child attached after cancellation");
            node.invoke(cause.as_ref());
            return Some(ChildHandle::attached(self.as_job(), Arc::clone(node)));
        }
        None
    }

    /// Completion no longer accepts children at all: the child is told the
    /// current cause and gets a non-disposable handle.
    fn refuse_child(&self, node: &Arc<Node>) -> ChildHandle {
        let cause = self.current_cancel_cause();
        node.invoke(cause.as_ref());
        ChildHandle::sentinel()
    }

    fn current_cancel_cause(&self) -> Option<Cause> {
        match self.cell.snapshot() {
            JobState::Finishing(finishing) => finishing.root_cause(),
            JobState::Completed(terminal) => terminal.cause().cloned(),
            _ => None,
        }
    }

    pub(crate) fn children(&self) -> Vec<Job> {
        let state = self.cell.snapshot();
        match &state {
            JobState::Single(node) => node.child_job().cloned().into_iter().collect(),
            _ => state.list().map_or_else(Vec::new, |list| list.children()),
        }
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    pub(crate) fn cancel_impl(self: &Arc<Self>, cause: Cause) -> bool {
        trace!(job_id = %self.id, cause = %cause, "cancel requested");
        if self.hooks.on_cancel_complete() {
            match self.make_completing(&Proposed::Failed(cause.clone())) {
                Completing::AlreadyDone => {}
                Completing::Waiting | Completing::Finalized => return true,
            }
        }
        self.make_cancelling(&cause)
    }

    /// Drives the job into the cancelling phase. Returns false when the
    /// cancellation arrived too late to be recorded (terminal state or a
    /// sealed record).
    fn make_cancelling(self: &Arc<Self>, cause: &Cause) -> bool {
        loop {
            let state = self.cell.snapshot();
            match &state {
                JobState::Completed(_) => return false,
                JobState::Finishing(finishing) => {
                    match finishing.record_cause(cause) {
                        Recorded::TooLate => return false,
                        Recorded::BecameCancelling => {
                            self.cell.refresh();
                            let list = Arc::clone(finishing.list());
                            self.notify_cancelling(&list, cause);
                            return true;
                        }
                        Recorded::Accumulated => return true,
                    }
                }
                JobState::Active | JobState::Single(_) => {
                    let _ = self.get_or_promote_list(&state);
                }
                JobState::Listed { list, active: true } => {
                    let list = Arc::clone(list);
                    let finishing = Arc::new(Finishing::new(Arc::clone(&list), Some(cause.clone())));
                    if self
                        .cell
                        .compare_and_set(&state, JobState::Finishing(finishing))
                    {
                        self.notify_cancelling(&list, cause);
                        return true;
                    }
                }
                JobState::New | JobState::Listed { active: false, .. } => {
                    // Never ran: complete exceptionally right away.
                    match self.make_completing(&Proposed::Failed(cause.clone())) {
                        Completing::AlreadyDone => {}
                        Completing::Waiting | Completing::Finalized => return true,
                    }
                }
            }
        }
    }

    /// Entering the cancelling phase: hook, close the phase, notify
    /// listeners in order, then tell the parent.
    fn notify_cancelling(self: &Arc<Self>, list: &Arc<NodeList>, cause: &Cause) {
        debug!(job_id = %self.id, cause = %cause, "job cancelling");
        self.hooks.on_cancelling(Some(cause));
        list.close(CLOSED_FOR_CANCELLATION);
        self.notify_nodes(list, Some(cause), Node::is_on_cancelling);
        self.cancel_parent(cause);
    }

    /// Invokes matching live nodes in registration order. Panics from
    /// listeners are aggregated (first as cause, rest suppressed) and handed
    /// to the hook after the pass; they never stop the traversal.
    fn notify_nodes(
        &self,
        list: &NodeList,
        cause: Option<&Cause>,
        filter: impl Fn(&Node) -> bool,
    ) {
        let mut first_panic: Option<String> = None;
        let mut suppressed: Vec<Cause> = Vec::new();
        for node in list.snapshot() {
            if node.is_removed() || !filter(node.as_ref()) {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| node.invoke(cause))) {
                let message = Cause::panic_message(payload.as_ref());
                match first_panic {
                    None => first_panic = Some(message),
                    Some(_) => suppressed.push(Cause::handler_panic(message, Vec::new())),
                }
            }
        }
        if let Some(message) = first_panic {
            self.hooks
                .handle_listener_panic(Cause::handler_panic(message, suppressed));
        }
    }

    // ---------------------------------------------------------------------
    // Parent propagation
    // ---------------------------------------------------------------------

    /// Offers the cause to the parent. Returns whether someone up the tree
    /// takes responsibility for it; cancellations are always "handled".
    fn cancel_parent(&self, cause: &Cause) -> bool {
        if self.hooks.is_scoped() {
            return true;
        }
        let is_cancellation = cause.is_cancellation();
        // Clone the handle out so the upcall runs without our lock held.
        let handle = {
            let guard = self.parent_guard();
            guard.as_ref().cloned()
        };
        match handle {
            None => is_cancellation,
            Some(handle) => handle.child_cancelled(cause) || is_cancellation,
        }
    }

    /// A child reports its cause. Cancellations are accepted silently;
    /// failures cancel this job unless it supervises its children.
    pub(crate) fn child_cancelled(self: &Arc<Self>, cause: &Cause) -> bool {
        if cause.is_cancellation() {
            return true;
        }
        if self.hooks.ignores_child_failures() {
            return false;
        }
        self.cancel_impl(cause.clone()) && self.handles_exception()
    }

    /// The parent is cancelling (or refused this child): cancel ourselves
    /// with a cause derived from the parent's.
    pub(crate) fn parent_cancelled(self: &Arc<Self>, cause: Option<&Cause>) {
        let delivered = match cause {
            Some(c) if c.is_cancellation() => c.clone(),
            Some(c) => Cause::parent_cancelled(Some(c.clone())),
            None => Cause::parent_cancelled(None),
        };
        self.cancel_impl(delivered);
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    pub(crate) fn make_completing(self: &Arc<Self>, proposed: &Proposed) -> Completing {
        loop {
            let state = self.cell.snapshot();
            if let JobState::Completed(_) = &state {
                return Completing::AlreadyDone;
            }

            // Fast path: nothing to wait for and nothing to record.
            let simple = match &state {
                JobState::New | JobState::Active => true,
                JobState::Single(node) => !node.is_child(),
                _ => false,
            };
            if simple && proposed.cause().is_none() {
                let terminal = Terminal::normal(proposed.value_cloned());
                if self
                    .cell
                    .compare_and_set(&state, JobState::Completed(terminal.clone()))
                {
                    debug!(job_id = %self.id, "job completed");
                    self.hooks.on_cancelling(None);
                    self.hooks.on_completion(&terminal);
                    self.complete_state_finalization(&state, &terminal);
                    return Completing::Finalized;
                }
                continue;
            }

            let Some(list) = self.get_or_promote_list(&state) else {
                continue;
            };
            let finishing = match &state {
                JobState::Finishing(finishing) => Arc::clone(finishing),
                _ => {
                    let finishing = Arc::new(Finishing::new(Arc::clone(&list), None));
                    if !self
                        .cell
                        .compare_and_set(&state, JobState::Finishing(Arc::clone(&finishing)))
                    {
                        continue;
                    }
                    finishing
                }
            };

            match finishing.begin_completing(proposed.cause()) {
                BeginCompleting::AlreadyCompleting => return Completing::AlreadyDone,
                BeginCompleting::Proceed {
                    was_cancelling,
                    root_cause,
                } => {
                    self.cell.refresh();
                    if !was_cancelling {
                        if let Some(root) = &root_cause {
                            self.notify_cancelling(&list, root);
                        }
                    }
                    return self.complete_or_wait(&finishing, None, proposed);
                }
            }
        }
    }

    /// Waits for the next incomplete child after `from`, or finalizes when
    /// none remain.
    fn complete_or_wait(
        self: &Arc<Self>,
        finishing: &Arc<Finishing>,
        from: Option<&Arc<Node>>,
        proposed: &Proposed,
    ) -> Completing {
        if let Some(child) = finishing.list().next_child_after(from) {
            if self.try_wait_for_child(finishing, child, proposed) {
                return Completing::Waiting;
            }
        }
        finishing.list().close(CLOSED_FOR_CHILDREN);
        // Closing and probing are two steps, not one: a child that slipped
        // in between is picked up by this second scan and still awaited.
        if let Some(child) = finishing.list().next_child_after(from) {
            if self.try_wait_for_child(finishing, child, proposed) {
                return Completing::Waiting;
            }
        }
        self.finalize_finishing(finishing, proposed);
        Completing::Finalized
    }

    /// Registers a one-shot completion callback on the child behind
    /// `child_node`. Children that are already complete are skipped in list
    /// order; returns false when none are left to wait for.
    fn try_wait_for_child(
        self: &Arc<Self>,
        finishing: &Arc<Finishing>,
        mut child_node: Arc<Node>,
        proposed: &Proposed,
    ) -> bool {
        loop {
            let child = match child_node.child_job() {
                Some(job) => job.clone(),
                None => return false,
            };
            let parent = Arc::clone(self);
            let record = Arc::clone(finishing);
            let waited = Arc::clone(&child_node);
            let proposed_again = proposed.clone();
            let registration = child.core().invoke_on_completion_node(
                Arc::new(Node::handler(false, move |_| {
                    parent.continue_completing(&record, &waited, &proposed_again);
                })),
                false,
            );
            if registration.is_attached() {
                trace!(job_id = %self.id, child = %child.id(), "waiting for child");
                return true;
            }
            match finishing.list().next_child_after(Some(&child_node)) {
                Some(next) => child_node = next,
                None => return false,
            }
        }
    }

    /// A waited-for child completed: resume the completion protocol.
    fn continue_completing(
        self: &Arc<Self>,
        finishing: &Arc<Finishing>,
        last_child: &Arc<Node>,
        proposed: &Proposed,
    ) {
        let _ = self.complete_or_wait(finishing, Some(last_child), proposed);
    }

    /// Seals the record, decides the final state, hands the cause off, and
    /// installs the terminal state. Only the thread owning `completing`
    /// reaches this, so the terminal CAS cannot lose.
    fn finalize_finishing(
        self: &Arc<Self>,
        finishing: &Arc<Finishing>,
        proposed: &Proposed,
    ) -> Terminal {
        let (causes, was_cancelling) = finishing.seal(proposed.cause());
        let final_cause = final_root_cause(was_cancelling, &causes);
        let suppressed = final_cause
            .as_ref()
            .map_or_else(Vec::new, |cause| collect_suppressed(cause, &causes));

        let mut handled = false;
        if let Some(cause) = &final_cause {
            handled = self.cancel_parent(cause) || self.hooks.handle_job_exception(cause);
        }

        let terminal = match &final_cause {
            None => Terminal::normal(proposed.value_cloned()),
            Some(cause) => Terminal::exceptional(cause.clone(), suppressed, handled),
        };

        if !was_cancelling {
            self.hooks.on_cancelling(final_cause.as_ref());
        }
        self.hooks.on_completion(&terminal);

        let prev = JobState::Finishing(Arc::clone(finishing));
        let installed = self
            .cell
            .compare_and_set(&prev, JobState::Completed(terminal.clone()));
        debug_assert!(installed, "completing thread lost the terminal transition");
        debug!(
            job_id = %self.id,
            exceptional = terminal.is_exceptional(),
            "job finalized"
        );

        self.complete_state_finalization(&prev, &terminal);
        terminal
    }

    /// Terminal phase: detach from the parent, close the list, notify every
    /// listener that has not fired yet.
    fn complete_state_finalization(&self, prev: &JobState, terminal: &Terminal) {
        self.dispose_parent_handle();
        let cause = terminal.cause();
        match prev {
            JobState::Single(node) => {
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| node.invoke(cause)))
                {
                    let message = Cause::panic_message(payload.as_ref());
                    self.hooks
                        .handle_listener_panic(Cause::handler_panic(message, Vec::new()));
                }
            }
            _ => {
                if let Some(list) = prev.list() {
                    list.close(CLOSED_FOR_COMPLETION);
                    self.notify_nodes(list, cause, |_| true);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// The cancellation view of this job's cause, once one exists.
    pub(crate) fn cancellation_cause(&self) -> Option<Cause> {
        match self.cell.snapshot() {
            JobState::Finishing(finishing) => {
                finishing.root_cause().map(Cause::cancellation_wrapping)
            }
            JobState::Completed(terminal) => {
                terminal.cause().cloned().map(Cause::cancellation_wrapping)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for JobCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCore")
            .field("id", &self.id)
            .field("lifecycle", &self.cell.lifecycle())
            .finish_non_exhaustive()
    }
}

/// Picks the final cause for a finalizing job.
///
/// No causes while cancelling synthesizes a default cancellation. A failure
/// beats any cancellation. Among pure cancellations the first wins, except
/// that a second, distinct timeout instance is preferred over the first
/// (the later one carries the context worth reporting).
fn final_root_cause(was_cancelling: bool, causes: &[Cause]) -> Option<Cause> {
    let Some(first) = causes.first() else {
        return was_cancelling.then(Cause::cancelled);
    };
    if let Some(failure) = causes.iter().find(|c| !c.is_cancellation()) {
        return Some(failure.clone());
    }
    if first.cancel_kind() == Some(CancelKind::Timeout) {
        if let Some(better) = causes[1..]
            .iter()
            .find(|c| !c.same(first) && c.cancel_kind() == Some(CancelKind::Timeout))
        {
            return Some(better.clone());
        }
    }
    Some(first.clone())
}

/// Everything that is not the final cause and not a cancellation rides along
/// as suppressed, deduplicated by identity.
fn collect_suppressed(final_cause: &Cause, causes: &[Cause]) -> Vec<Cause> {
    if causes.len() <= 1 {
        return Vec::new();
    }
    let mut out: Vec<Cause> = Vec::new();
    for cause in causes {
        if cause.same(final_cause) || cause.is_cancellation() {
            continue;
        }
        if out.iter().any(|c| c.same(cause)) {
            continue;
        }
        out.push(cause.clone());
    }
    out
}

/// A handle to a job in the tree. Clones refer to the same job.
#[derive(Clone, Debug)]
pub struct Job {
    core: Arc<JobCore>,
}

impl Job {
    /// Creates an active job, optionally attached to a parent.
    ///
    /// A plain job has no body: cancelling it completes it.
    #[must_use]
    pub fn new(parent: Option<&Job>) -> Self {
        Self::build(parent, Box::new(BaseHooks { supervisor: false }), true, true)
    }

    /// Creates a supervisor job: children's failures do not cancel it or
    /// their siblings.
    #[must_use]
    pub fn supervisor(parent: Option<&Job>) -> Self {
        Self::build(parent, Box::new(BaseHooks { supervisor: true }), true, true)
    }

    /// Creates a job driven by custom hooks. `active` picks the initial
    /// state; an inactive job needs [`start`](Self::start) before it runs.
    #[must_use]
    pub fn with_hooks(parent: Option<&Job>, hooks: impl JobHooks + 'static, active: bool) -> Self {
        Self::build(parent, Box::new(hooks), active, false)
    }

    fn build(
        parent: Option<&Job>,
        hooks: Box<dyn JobHooks>,
        active: bool,
        resolve_handles: bool,
    ) -> Self {
        let core = Arc::new(JobCore::new(hooks, active));
        let job = Job { core };
        debug!(
            job_id = %job.id(),
            parent = parent.map(|p| p.id().as_u64()),
            "job created"
        );
        if let Some(parent) = parent {
            parent.start();
            let handle = parent.core().attach_child(&job);
            if handle.is_attached() {
                job.core.set_parent_handle(handle);
                if job.is_completed() {
                    job.core.dispose_parent_handle();
                }
            }
        }
        if resolve_handles {
            let computed = job.core.compute_handles_exception();
            job.core
                .handles_exception
                .store(computed, Ordering::Release);
        }
        job
    }

    pub(crate) fn core(&self) -> &Arc<JobCore> {
        &self.core
    }

    /// Debug identity.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.core.id()
    }

    /// True if two handles refer to the same job.
    #[must_use]
    pub fn same(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Starts the job. Returns true if this call performed the transition;
    /// false if the job was already started or is past starting.
    pub fn start(&self) -> bool {
        self.core.start()
    }

    /// Started and not cancelling.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.lifecycle().is_active()
    }

    /// Reached a terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.core.lifecycle().is_completed()
    }

    /// Cancelling or terminated exceptionally.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.core.lifecycle().is_cancelled()
    }

    /// The coarse lifecycle phase.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// The terminal state, once reached.
    #[must_use]
    pub fn terminal(&self) -> Option<Terminal> {
        self.core.terminal()
    }

    /// Requests cancellation with the given cause (or a default one).
    pub fn cancel(&self, cause: Option<Cause>) {
        let cause = cause.unwrap_or_else(Cause::cancelled);
        self.core.cancel_impl(cause);
    }

    /// Cancels, then waits for the job (and all children) to finish.
    pub async fn cancel_and_join(&self) {
        self.cancel(None);
        self.join().await;
    }

    /// Cancels every current child with the given cause (or a default one),
    /// leaving this job itself untouched.
    pub fn cancel_children(&self, cause: Option<Cause>) {
        let cause = cause.unwrap_or_else(Cause::cancelled);
        for child in self.children() {
            child.core().cancel_impl(cause.clone());
        }
    }

    /// Completes the job normally. Returns true if this call initiated
    /// completion (the job may still wait for children before terminating).
    pub fn complete(&self) -> bool {
        self.complete_proposed(&Proposed::Value(None))
    }

    /// Completes the job with a failure cause.
    pub fn complete_exceptionally(&self, cause: Cause) -> bool {
        self.complete_proposed(&Proposed::Failed(cause))
    }

    pub(crate) fn complete_proposed(&self, proposed: &Proposed) -> bool {
        !matches!(
            self.core.make_completing(proposed),
            Completing::AlreadyDone
        )
    }

    /// Suspends until the job reaches a terminal state, starting it first if
    /// needed. Dropping the future cleanly unregisters the waiter.
    #[must_use]
    pub fn join(&self) -> JoinFuture {
        JoinFuture::new(self.clone())
    }

    /// Registration endpoint for selecting over this job's completion.
    #[must_use]
    pub fn on_join(&self) -> OnJoin {
        OnJoin::new(self.clone())
    }

    /// Registers a terminal-phase listener that is invoked synchronously if
    /// the job is already terminal. See
    /// [`invoke_on_completion_with`](Self::invoke_on_completion_with).
    pub fn invoke_on_completion(
        &self,
        handler: impl Fn(Option<&Cause>) + Send + Sync + 'static,
    ) -> Disposable {
        self.invoke_on_completion_with(false, true, handler)
    }

    /// Registers a listener for one notification phase.
    ///
    /// With `on_cancelling`, the listener fires when the job enters the
    /// cancelling phase (or at terminal when no cancellation ever happened);
    /// otherwise it fires in the terminal phase. With `invoke_immediately`,
    /// a listener whose phase already passed is invoked synchronously on
    /// this thread with the recorded cause. Every listener fires at most
    /// once; the returned handle unlinks it.
    pub fn invoke_on_completion_with(
        &self,
        on_cancelling: bool,
        invoke_immediately: bool,
        handler: impl Fn(Option<&Cause>) + Send + Sync + 'static,
    ) -> Disposable {
        let node = Arc::new(Node::handler(on_cancelling, handler));
        self.core.invoke_on_completion_node(node, invoke_immediately)
    }

    /// Attaches `child` so this job waits for it and cancels it on its own
    /// cancellation. Normally called through the child's constructor.
    pub fn attach_child(&self, child: &Job) -> ChildHandle {
        self.core.attach_child(child)
    }

    /// Snapshot of the currently attached children.
    #[must_use]
    pub fn children(&self) -> Vec<Job> {
        self.core.children()
    }

    /// The cancellation cause of this job, as soon as one is recorded.
    /// Failures are wrapped in a cancellation view.
    #[must_use]
    pub fn cancellation_cause(&self) -> Option<Cause> {
        self.core.cancellation_cause()
    }

    /// Returns `Err` describing why the job is not active; the cooperative
    /// check for bodies running under this job. Only a cancelled job
    /// reports a cancellation cause — normal completion and a not-yet-
    /// started job get their own variants.
    pub fn ensure_active(&self) -> Result<(), NotActiveError> {
        match self.lifecycle() {
            Lifecycle::Active | Lifecycle::Completing => Ok(()),
            Lifecycle::New | Lifecycle::Inactive => Err(NotActiveError::NotStarted),
            Lifecycle::Completed => Err(NotActiveError::Completed),
            Lifecycle::Cancelling | Lifecycle::Cancelled => Err(NotActiveError::Cancelled(
                self.core
                    .cancellation_cause()
                    .unwrap_or_else(Cause::cancelled),
            )),
        }
    }

    pub(crate) fn parent_cancelled(&self, cause: Option<&Cause>) {
        self.core.parent_cancelled(cause);
    }
}
