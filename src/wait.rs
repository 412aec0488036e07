//! Suspension adapters: waiting for a job from async code.
//!
//! [`JoinFuture`] and [`AwaitFuture`] bridge the listener machinery to
//! `std::future`: the first poll registers a one-shot terminal-phase
//! listener that wakes the stored waker, and readiness is re-checked through
//! the listener's fired flag.
//!
//! # Cancel safety
//!
//! Both futures are cancel-safe: dropping one before completion disposes its
//! listener, so an abandoned waiter never leaks a list entry and never gets
//! woken spuriously.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::cause::{Cause, StateError};
use crate::child::Disposable;
use crate::job::Job;
use crate::list::Node;
use crate::state::Terminal;

/// Shared flag between a waiting future and its listener.
#[derive(Debug, Default)]
struct WaitShared {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl WaitShared {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        let waker = match self.waker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn store_waker(&self, waker: &Waker) {
        let mut guard = match self.waker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(waker.clone());
    }
}

#[derive(Debug)]
struct Registration {
    shared: Arc<WaitShared>,
    listener: Disposable,
}

/// Registers the terminal-phase listener on first poll. Returns `None` when
/// the job turned out to be already terminal.
fn register(job: &Job, waker: &Waker) -> Option<Registration> {
    let shared = Arc::new(WaitShared::default());
    shared.store_waker(waker);
    let callback = Arc::clone(&shared);
    let listener = job.core().invoke_on_completion_node(
        Arc::new(Node::handler(false, move |_| callback.fire())),
        true,
    );
    if shared.is_fired() {
        None
    } else {
        Some(Registration { shared, listener })
    }
}

fn poll_terminal(job: &Job, registration: &mut Option<Registration>, cx: &Context<'_>) -> bool {
    if let Some(active) = registration {
        if active.shared.is_fired() {
            return true;
        }
        active.shared.store_waker(cx.waker());
        // Re-check: the listener may have fired while the waker was swapped.
        return active.shared.is_fired();
    }
    job.start();
    if job.is_completed() {
        return true;
    }
    match register(job, cx.waker()) {
        None => true,
        Some(reg) => {
            *registration = Some(reg);
            false
        }
    }
}

/// Future returned by [`Job::join`]: resolves when the job (and every
/// child it waits for) reaches a terminal state.
#[derive(Debug)]
pub struct JoinFuture {
    job: Job,
    registration: Option<Registration>,
}

impl JoinFuture {
    pub(crate) fn new(job: Job) -> Self {
        Self {
            job,
            registration: None,
        }
    }
}

impl Future for JoinFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if poll_terminal(&this.job, &mut this.registration, cx) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for JoinFuture {
    fn drop(&mut self) {
        if let Some(registration) = &self.registration {
            registration.listener.dispose();
        }
    }
}

/// Future behind `CompletableDeferred::wait`: resolves to the completion
/// value, or to the cause the job terminated with.
#[derive(Debug)]
pub struct AwaitFuture<T> {
    job: Job,
    registration: Option<Registration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AwaitFuture<T> {
    pub(crate) fn new(job: Job) -> Self {
        Self {
            job,
            registration: None,
            _marker: PhantomData,
        }
    }
}

/// Reads the typed value out of a terminal state.
pub(crate) fn extract_value<T: Clone + Send + Sync + 'static>(
    terminal: &Terminal,
) -> Result<T, StateError> {
    if let Some(cause) = terminal.cause() {
        return Err(StateError::Failed(cause.clone()));
    }
    terminal
        .value()
        .and_then(|value| Arc::clone(value).downcast::<T>().ok())
        .map(|value| (*value).clone())
        .ok_or(StateError::ValueType)
}

impl<T: Clone + Send + Sync + 'static> Future for AwaitFuture<T> {
    type Output = Result<T, Cause>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !poll_terminal(&this.job, &mut this.registration, cx) {
            return Poll::Pending;
        }
        let result = match this.job.terminal() {
            Some(terminal) => match extract_value::<T>(&terminal) {
                Ok(value) => Ok(value),
                Err(StateError::Failed(cause)) => Err(cause),
                Err(other) => Err(Cause::failure(other)),
            },
            // Unreachable in practice: the listener fires at terminal.
            None => Err(Cause::failure(StateError::Incomplete)),
        };
        Poll::Ready(result)
    }
}

impl<T> Drop for AwaitFuture<T> {
    fn drop(&mut self) {
        if let Some(registration) = &self.registration {
            registration.listener.dispose();
        }
    }
}
