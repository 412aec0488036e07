//! Completable deferred values: a job with a typed result.
//!
//! A [`CompletableDeferred`] is a job handle whose normal completion carries
//! a value of type `T`. The job semantics are unchanged: it participates in
//! the tree, cancellation completes it exceptionally, and a completing
//! deferred still waits for attached children before its value becomes
//! observable.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cause::{Cause, StateError};
use crate::job::{Job, Proposed};
use crate::select::OnAwait;
use crate::state::CompletionValue;
use crate::wait::{extract_value, AwaitFuture};

/// A job that completes with a value of type `T`.
///
/// Values are handed out by clone; `T` is stored once and shared.
#[derive(Debug, Clone)]
pub struct CompletableDeferred<T> {
    job: Job,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> CompletableDeferred<T> {
    /// Creates an active deferred, optionally attached to a parent.
    #[must_use]
    pub fn new(parent: Option<&Job>) -> Self {
        Self {
            job: Job::new(parent),
            _marker: PhantomData,
        }
    }

    /// The underlying job handle.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Completes with `value`. Returns true if this call initiated
    /// completion; false if the deferred was already completing or complete.
    pub fn complete(&self, value: T) -> bool {
        let value: CompletionValue = Arc::new(value);
        self.job.complete_proposed(&Proposed::Value(Some(value)))
    }

    /// Completes exceptionally with `cause`.
    pub fn complete_exceptionally(&self, cause: Cause) -> bool {
        self.job.complete_exceptionally(cause)
    }

    /// Completes from a result: `Ok` carries the value, `Err` the cause.
    pub fn complete_with(&self, result: Result<T, Cause>) -> bool {
        match result {
            Ok(value) => self.complete(value),
            Err(cause) => self.complete_exceptionally(cause),
        }
    }

    /// Suspends until the value (or the terminal cause) is available,
    /// starting the job first if needed.
    #[must_use]
    pub fn wait(&self) -> AwaitFuture<T> {
        AwaitFuture::new(self.job.clone())
    }

    /// The completed value, without suspending.
    ///
    /// # Errors
    ///
    /// [`StateError::Incomplete`] while the deferred has not terminated,
    /// [`StateError::Failed`] when it terminated exceptionally.
    pub fn completed_value(&self) -> Result<T, StateError> {
        match self.job.terminal() {
            Some(terminal) => extract_value::<T>(&terminal),
            None => Err(StateError::Incomplete),
        }
    }

    /// Registration endpoint for selecting over the value.
    #[must_use]
    pub fn on_await(&self) -> OnAwait<T> {
        OnAwait::new(self.job.clone())
    }
}
