//! Job state variants and the atomic lifecycle mirror.
//!
//! The authoritative [`JobState`] lives behind the [`StateCell`] lock; a
//! coarse [`Lifecycle`] value is mirrored into an atomic beside it so status
//! reads (`is_active`, `is_completed`, `is_cancelled`) never take the lock.
//!
//! State machine:
//!
//! ```text
//! New ──start──▶ Active ──listener──▶ Single ──▶ Listed(active)
//!  │                                                  │
//!  └──listener──▶ Listed(inactive) ──start────────────┘
//!                        │                            │
//!                        ▼                            ▼
//!                  Completed ◀──finalize── Finishing(record)
//! ```
//!
//! Every transition is a compare-and-swap: [`StateCell::compare_and_set`]
//! succeeds only when the current state is the exact snapshot the caller
//! observed (variant and `Arc` identity), so racing transitions lose and
//! retry. The mirror is published with release ordering inside the same
//! critical section.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cause::Cause;
use crate::finishing::Finishing;
use crate::list::{Node, NodeList};

/// Type-erased completion value carried by a terminal state.
pub type CompletionValue = Arc<dyn Any + Send + Sync>;

/// Terminal state of a job: a value or an attributed failure.
#[derive(Clone)]
pub struct Terminal {
    value: Option<CompletionValue>,
    cause: Option<Cause>,
    suppressed: Vec<Cause>,
    handled: bool,
}

impl Terminal {
    pub(crate) fn normal(value: Option<CompletionValue>) -> Self {
        Self {
            value,
            cause: None,
            suppressed: Vec::new(),
            handled: false,
        }
    }

    pub(crate) fn exceptional(cause: Cause, suppressed: Vec<Cause>, handled: bool) -> Self {
        Self {
            value: None,
            cause: Some(cause),
            suppressed,
            handled,
        }
    }

    /// The cause this job terminated with, if it did not complete normally.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Additional causes that were aggregated during finalization.
    #[must_use]
    pub fn suppressed(&self) -> &[Cause] {
        &self.suppressed
    }

    /// True if the job terminated with a cause.
    #[must_use]
    pub fn is_exceptional(&self) -> bool {
        self.cause.is_some()
    }

    /// True if the cause was handed off to a parent or an exception handler.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub(crate) fn value(&self) -> Option<&CompletionValue> {
        self.value.as_ref()
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("has_value", &self.value.is_some())
            .field("cause", &self.cause)
            .field("suppressed", &self.suppressed.len())
            .field("handled", &self.handled)
            .finish()
    }
}

/// The full job state. Clones are cheap (`Arc` handles).
#[derive(Clone)]
pub(crate) enum JobState {
    /// Created, not started, no listeners.
    New,
    /// Started, no listeners.
    Active,
    /// Started, exactly one listener.
    Single(Arc<Node>),
    /// A listener list is attached; `active` mirrors whether the job started.
    /// An inactive list never collapses back to `New`.
    Listed { list: Arc<NodeList>, active: bool },
    /// Cancelling and/or completing; the record owns the list.
    Finishing(Arc<Finishing>),
    /// Terminal; never transitions further.
    Completed(Terminal),
}

impl JobState {
    /// The listener list, when this state carries one.
    pub(crate) fn list(&self) -> Option<&Arc<NodeList>> {
        match self {
            Self::Listed { list, .. } => Some(list),
            Self::Finishing(finishing) => Some(finishing.list()),
            _ => None,
        }
    }

    /// Whether two snapshots denote the same state for CAS purposes:
    /// same variant and same heap identity for the carried handles.
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::New, Self::New) | (Self::Active, Self::Active) => true,
            (Self::Single(a), Self::Single(b)) => Arc::ptr_eq(a, b),
            (
                Self::Listed { list: a, active: x },
                Self::Listed { list: b, active: y },
            ) => Arc::ptr_eq(a, b) && x == y,
            (Self::Finishing(a), Self::Finishing(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Active => write!(f, "Active"),
            Self::Single(_) => write!(f, "Single"),
            Self::Listed { active, .. } => write!(f, "Listed {{ active: {active} }}"),
            Self::Finishing(_) => write!(f, "Finishing"),
            Self::Completed(t) => write!(f, "Completed {{ exceptional: {} }}", t.is_exceptional()),
        }
    }
}

/// Coarse lifecycle phase, mirrored atomically for lock-free status reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Created but not started.
    New = 0,
    /// Started; body may be running.
    Active = 1,
    /// Not started, but listeners are attached.
    Inactive = 2,
    /// Completion is in progress with no cancellation recorded.
    Completing = 3,
    /// A root cause is recorded; cancellation listeners fired or firing.
    Cancelling = 4,
    /// Terminal success.
    Completed = 5,
    /// Terminal failure or cancellation.
    Cancelled = 6,
}

impl Lifecycle {
    const fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Inactive,
            3 => Self::Completing,
            4 => Self::Cancelling,
            5 => Self::Completed,
            6 => Self::Cancelled,
            v => {
                debug_assert!(false, "invalid lifecycle value: {v}");
                Self::Cancelled
            }
        }
    }

    /// Started and not cancelling. A job that is completing without a
    /// recorded cause still counts as active.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Completing)
    }

    /// Reached a terminal state.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// A root cause is recorded or the job terminated exceptionally.
    #[must_use]
    pub fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelling | Self::Cancelled)
    }

    /// Stable name for logging.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Completing => "completing",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn lifecycle_of(state: &JobState) -> Lifecycle {
    match state {
        JobState::New => Lifecycle::New,
        JobState::Active | JobState::Single(_) => Lifecycle::Active,
        JobState::Listed { active: true, .. } => Lifecycle::Active,
        JobState::Listed { active: false, .. } => Lifecycle::Inactive,
        JobState::Finishing(finishing) => {
            if finishing.is_cancelling() {
                Lifecycle::Cancelling
            } else {
                Lifecycle::Completing
            }
        }
        JobState::Completed(terminal) => {
            if terminal.is_exceptional() {
                Lifecycle::Cancelled
            } else {
                Lifecycle::Completed
            }
        }
    }
}

/// The job's state cell: authoritative state under a short lock, coarse
/// lifecycle mirrored atomically beside it.
pub(crate) struct StateCell {
    lifecycle: AtomicU8,
    state: Mutex<JobState>,
}

impl StateCell {
    pub(crate) fn new(initial: JobState) -> Self {
        let lifecycle = AtomicU8::new(lifecycle_of(&initial).as_u8());
        Self {
            lifecycle,
            state: Mutex::new(initial),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, guard: &JobState) {
        self.lifecycle
            .store(lifecycle_of(guard).as_u8(), Ordering::Release);
    }

    /// Lock-free coarse status.
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// A clone of the current state.
    pub(crate) fn snapshot(&self) -> JobState {
        self.lock().clone()
    }

    /// Installs `new` iff the current state is still `expected` (variant and
    /// identity). Returns false on CAS loss; callers retry on a fresh
    /// snapshot.
    pub(crate) fn compare_and_set(&self, expected: &JobState, new: JobState) -> bool {
        let mut guard = self.lock();
        if !guard.same(expected) {
            return false;
        }
        *guard = new;
        self.publish(&guard);
        true
    }

    /// Recomputes the mirror from the current state.
    ///
    /// Needed when a `Finishing` record becomes cancelling: the record
    /// mutates without a state-cell transition, so the mirror is refreshed
    /// explicitly afterwards.
    pub(crate) fn refresh(&self) {
        let guard = self.lock();
        self.publish(&guard);
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_predicates() {
        assert!(Lifecycle::Active.is_active());
        assert!(Lifecycle::Completing.is_active());
        assert!(!Lifecycle::Cancelling.is_active());
        assert!(!Lifecycle::New.is_active());

        assert!(Lifecycle::Completed.is_completed());
        assert!(Lifecycle::Cancelled.is_completed());
        assert!(!Lifecycle::Cancelling.is_completed());

        assert!(Lifecycle::Cancelling.is_cancelled());
        assert!(Lifecycle::Cancelled.is_cancelled());
        assert!(!Lifecycle::Completed.is_cancelled());
    }

    #[test]
    fn cas_requires_identity() {
        let cell = StateCell::new(JobState::New);
        let stale = JobState::Active;
        assert!(!cell.compare_and_set(&stale, JobState::Completed(Terminal::normal(None))));

        let snap = cell.snapshot();
        assert!(cell.compare_and_set(&snap, JobState::Active));
        assert_eq!(cell.lifecycle(), Lifecycle::Active);

        // The old snapshot no longer matches.
        assert!(!cell.compare_and_set(&snap, JobState::New));
    }

    #[test]
    fn cas_distinguishes_list_identity() {
        let list_a = Arc::new(NodeList::new());
        let list_b = Arc::new(NodeList::new());
        let cell = StateCell::new(JobState::Listed {
            list: Arc::clone(&list_a),
            active: true,
        });

        let wrong = JobState::Listed {
            list: list_b,
            active: true,
        };
        assert!(!cell.compare_and_set(&wrong, JobState::Active));

        let right = JobState::Listed {
            list: list_a,
            active: true,
        };
        assert!(cell.compare_and_set(&right, JobState::Active));
    }

    #[test]
    fn mirror_tracks_terminal_kind() {
        let cell = StateCell::new(JobState::Active);
        let snap = cell.snapshot();
        let terminal = Terminal::exceptional(crate::cause::Cause::cancelled(), Vec::new(), true);
        assert!(cell.compare_and_set(&snap, JobState::Completed(terminal)));
        assert_eq!(cell.lifecycle(), Lifecycle::Cancelled);
        assert!(cell.lifecycle().is_cancelled());
        assert!(cell.lifecycle().is_completed());
    }
}
