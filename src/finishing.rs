//! The finishing record: cancellation/completion bookkeeping for one job.
//!
//! Once a job leaves the plain incomplete states it holds a [`Finishing`]
//! record until finalization. The record accumulates every cause observed
//! while the job winds down, remembers which one arrived first (the root
//! cause), and arbitrates the single `completing` flag that decides which
//! thread gets to finalize.
//!
//! All compound mutation happens under the record's own mutex; the
//! `completing` and `cancelling` flags are additionally mirrored in atomics
//! so status reads stay lock-free. While the record is unsealed the owning
//! state cell still points at it, which is what makes the mutex-guarded
//! reads here sound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cause::Cause;
use crate::list::NodeList;

/// Outcome of recording a cause on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// The record was already sealed; the cause was dropped.
    TooLate,
    /// This cause is the first one: the record just became cancelling and
    /// the caller owns the cancellation notifications.
    BecameCancelling,
    /// The cause was added (or deduplicated) behind an existing root cause.
    Accumulated,
}

/// Outcome of claiming the completing flag.
#[derive(Debug)]
pub(crate) enum BeginCompleting {
    /// Another thread already owns completion.
    AlreadyCompleting,
    /// The caller owns completion now.
    Proceed {
        /// Whether the record was cancelling before this claim; when false
        /// and `root_cause` is set, the caller also owns the cancellation
        /// notifications.
        was_cancelling: bool,
        /// The root cause after the proposed cause (if any) was folded in.
        root_cause: Option<Cause>,
    },
}

#[derive(Debug)]
struct Inner {
    root_cause: Option<Cause>,
    /// Causes observed after the root, identity-deduplicated.
    more: Vec<Cause>,
    sealed: bool,
}

/// Mutable aggregate for a cancelling and/or completing job.
pub(crate) struct Finishing {
    list: Arc<NodeList>,
    completing: AtomicBool,
    cancelling: AtomicBool,
    inner: Mutex<Inner>,
}

impl Finishing {
    pub(crate) fn new(list: Arc<NodeList>, root_cause: Option<Cause>) -> Self {
        let cancelling = root_cause.is_some();
        Self {
            list,
            completing: AtomicBool::new(false),
            cancelling: AtomicBool::new(cancelling),
            inner: Mutex::new(Inner {
                root_cause,
                more: Vec::new(),
                sealed: false,
            }),
        }
    }

    pub(crate) fn list(&self) -> &Arc<NodeList> {
        &self.list
    }

    /// Lock-free: has a root cause been recorded?
    pub(crate) fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::Acquire)
    }

    /// Lock-free: has a thread claimed completion?
    pub(crate) fn is_completing(&self) -> bool {
        self.completing.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn add_locked(&self, inner: &mut Inner, cause: &Cause) -> Recorded {
        match &inner.root_cause {
            None => {
                inner.root_cause = Some(cause.clone());
                self.cancelling.store(true, Ordering::Release);
                Recorded::BecameCancelling
            }
            Some(root) if root.same(cause) => Recorded::Accumulated,
            Some(_) => {
                if !inner.more.iter().any(|c| c.same(cause)) {
                    inner.more.push(cause.clone());
                }
                Recorded::Accumulated
            }
        }
    }

    /// Records a cause, unless the record is sealed.
    pub(crate) fn record_cause(&self, cause: &Cause) -> Recorded {
        let mut inner = self.lock();
        if inner.sealed {
            return Recorded::TooLate;
        }
        self.add_locked(&mut inner, cause)
    }

    /// A clone of the current root cause.
    pub(crate) fn root_cause(&self) -> Option<Cause> {
        self.lock().root_cause.clone()
    }

    /// Claims the completing flag, folding in the proposed cause while the
    /// lock is held so the claim and the cause recording are one step.
    pub(crate) fn begin_completing(&self, proposed_cause: Option<&Cause>) -> BeginCompleting {
        let mut inner = self.lock();
        if self.completing.load(Ordering::Acquire) {
            return BeginCompleting::AlreadyCompleting;
        }
        self.completing.store(true, Ordering::Release);
        let was_cancelling = inner.root_cause.is_some();
        if let Some(cause) = proposed_cause {
            self.add_locked(&mut inner, cause);
        }
        BeginCompleting::Proceed {
            was_cancelling,
            root_cause: inner.root_cause.clone(),
        }
    }

    /// Seals the record and returns the ordered cause list: root first, the
    /// rest in arrival order, then `proposed` unless it is already present.
    ///
    /// Must be called at most once, by the thread that owns `completing`.
    pub(crate) fn seal(&self, proposed: Option<&Cause>) -> (Vec<Cause>, bool) {
        let mut inner = self.lock();
        debug_assert!(!inner.sealed, "finishing record sealed twice");
        inner.sealed = true;
        let was_cancelling = inner.root_cause.is_some();

        let mut causes = Vec::with_capacity(inner.more.len() + 2);
        if let Some(root) = &inner.root_cause {
            causes.push(root.clone());
        }
        causes.extend(inner.more.iter().cloned());
        if let Some(proposed) = proposed {
            if !causes.iter().any(|c| c.same(proposed)) {
                causes.push(proposed.clone());
            }
        }
        (causes, was_cancelling)
    }
}

impl std::fmt::Debug for Finishing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finishing")
            .field("completing", &self.is_completing())
            .field("cancelling", &self.is_cancelling())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Finishing {
        Finishing::new(Arc::new(NodeList::new()), None)
    }

    #[test]
    fn first_cause_becomes_root() {
        let finishing = record();
        assert!(!finishing.is_cancelling());

        let cause = Cause::cancelled();
        assert_eq!(finishing.record_cause(&cause), Recorded::BecameCancelling);
        assert!(finishing.is_cancelling());
        assert!(finishing.root_cause().unwrap().same(&cause));

        let other = Cause::failure_msg("boom");
        assert_eq!(finishing.record_cause(&other), Recorded::Accumulated);
        assert!(finishing.root_cause().unwrap().same(&cause));
    }

    #[test]
    fn duplicate_identity_is_skipped() {
        let finishing = record();
        let cause = Cause::failure_msg("boom");
        finishing.record_cause(&cause);
        finishing.record_cause(&cause);
        finishing.record_cause(&cause.clone());

        let (causes, was_cancelling) = finishing.seal(None);
        assert!(was_cancelling);
        assert_eq!(causes.len(), 1);
    }

    #[test]
    fn seal_orders_root_first_and_appends_distinct_proposed() {
        let finishing = record();
        let root = Cause::cancelled();
        let second = Cause::failure_msg("boom");
        finishing.record_cause(&root);
        finishing.record_cause(&second);

        let proposed = Cause::failure_msg("late");
        let (causes, _) = finishing.seal(Some(&proposed));
        assert_eq!(causes.len(), 3);
        assert!(causes[0].same(&root));
        assert!(causes[1].same(&second));
        assert!(causes[2].same(&proposed));
    }

    #[test]
    fn seal_skips_proposed_already_recorded() {
        let finishing = record();
        let cause = Cause::failure_msg("boom");
        finishing.record_cause(&cause);
        let (causes, _) = finishing.seal(Some(&cause));
        assert_eq!(causes.len(), 1);
    }

    #[test]
    fn record_after_seal_is_too_late() {
        let finishing = record();
        finishing.seal(None);
        assert_eq!(
            finishing.record_cause(&Cause::cancelled()),
            Recorded::TooLate
        );
    }

    #[test]
    fn completing_claim_is_exclusive() {
        let finishing = record();
        let cause = Cause::failure_msg("boom");
        match finishing.begin_completing(Some(&cause)) {
            BeginCompleting::Proceed {
                was_cancelling,
                root_cause,
            } => {
                assert!(!was_cancelling);
                assert!(root_cause.unwrap().same(&cause));
            }
            BeginCompleting::AlreadyCompleting => panic!("first claim must win"),
        }
        assert!(matches!(
            finishing.begin_completing(None),
            BeginCompleting::AlreadyCompleting
        ));
    }

    #[test]
    fn claim_on_cancelling_record_reports_was_cancelling() {
        let finishing = record();
        finishing.record_cause(&Cause::cancelled());
        match finishing.begin_completing(None) {
            BeginCompleting::Proceed { was_cancelling, .. } => assert!(was_cancelling),
            BeginCompleting::AlreadyCompleting => panic!("claim must win"),
        }
    }
}
