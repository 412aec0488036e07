//! Selectable clauses: composing a job into a select-over-many primitive.
//!
//! A select framework drives these endpoints as follows: it creates one
//! [`SelectClaim`] for the whole select, calls `register` on every clause,
//! and parks. The first clause whose event fires wins the claim and wakes
//! the select; every other notification sees the claim taken and is dropped.
//! Losing registrations are disposed by the framework, so their listeners
//! never fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;

use crate::cause::StateError;
use crate::child::Disposable;
use crate::job::Job;
use crate::list::Node;
use crate::wait::extract_value;

/// First-winner arbitration flag shared by the clauses of one select.
#[derive(Debug, Clone, Default)]
pub struct SelectClaim {
    claimed: Arc<AtomicBool>,
}

impl SelectClaim {
    /// A fresh, unclaimed flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to claim the select. Exactly one caller ever wins.
    #[must_use]
    pub fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// True once some clause has won.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

fn register_claiming(job: &Job, claim: &SelectClaim, waker: Waker) -> Disposable {
    job.start();
    let claim = claim.clone();
    job.core().invoke_on_completion_node(
        Arc::new(Node::handler(false, move |_| {
            if claim.try_claim() {
                waker.wake_by_ref();
            }
        })),
        true,
    )
}

/// Clause selecting on a job's completion (the `join` event).
#[derive(Debug, Clone)]
pub struct OnJoin {
    job: Job,
}

impl OnJoin {
    pub(crate) fn new(job: Job) -> Self {
        Self { job }
    }

    /// True when the clause would fire without waiting.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.job.is_completed()
    }

    /// Registers a one-shot listener that tries to claim the select when the
    /// job completes. If the job is already terminal the claim is attempted
    /// synchronously. Dispose the returned handle when another clause wins.
    pub fn register(&self, claim: &SelectClaim, waker: Waker) -> Disposable {
        register_claiming(&self.job, claim, waker)
    }
}

/// Clause selecting on a deferred value becoming available (the `await`
/// event).
#[derive(Debug, Clone)]
pub struct OnAwait<T> {
    job: Job,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> OnAwait<T> {
    pub(crate) fn new(job: Job) -> Self {
        Self {
            job,
            _marker: std::marker::PhantomData,
        }
    }

    /// True when the clause would fire without waiting.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.job.is_completed()
    }

    /// Registers a one-shot claiming listener; see [`OnJoin::register`].
    pub fn register(&self, claim: &SelectClaim, waker: Waker) -> Disposable {
        register_claiming(&self.job, claim, waker)
    }

    /// Reads the selected value after this clause won the claim.
    pub fn result(&self) -> Result<T, StateError> {
        match self.job.terminal() {
            Some(terminal) => extract_value::<T>(&terminal),
            None => Err(StateError::Incomplete),
        }
    }
}
