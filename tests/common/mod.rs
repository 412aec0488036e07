#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! #[macro_use]
//! mod common;
//! use common::*;
//! ```

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use jobtree::{Cause, JobHooks, Terminal};

static INIT_LOGGING: Once = Once::new();

/// Initialize tracing output for tests. The first call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

/// Drives a future to completion by parking between polls.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => thread::park(),
        }
    }
}

/// Spins until `predicate` holds, panicking after `timeout`.
pub fn wait_until(timeout: Duration, description: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        thread::yield_now();
    }
}

/// Hooks with observable counters, for asserting the hook contract.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    /// Treat cancellation as completion (pure job handles do).
    pub cancel_completes: bool,
    /// Supervisor policy.
    pub ignores_child_failures: bool,
    /// Claim unhandled failures in `handle_job_exception`.
    pub absorbs_failures: bool,
    pub started: AtomicUsize,
    pub cancelling: AtomicUsize,
    pub cancelling_cause: Mutex<Option<Option<Cause>>>,
    pub completed: AtomicUsize,
    pub job_exceptions: Mutex<Vec<Cause>>,
    pub listener_panics: Mutex<Vec<Cause>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completing_on_cancel() -> Arc<Self> {
        Arc::new(Self {
            cancel_completes: true,
            ..Self::default()
        })
    }
}

impl JobHooks for RecordingHooks {
    fn on_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cancelling(&self, cause: Option<&Cause>) {
        self.cancelling.fetch_add(1, Ordering::SeqCst);
        *self.cancelling_cause.lock().unwrap() = Some(cause.cloned());
    }

    fn on_completion(&self, _terminal: &Terminal) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_job_exception(&self, cause: &Cause) -> bool {
        self.job_exceptions.lock().unwrap().push(cause.clone());
        self.absorbs_failures
    }

    fn on_cancel_complete(&self) -> bool {
        self.cancel_completes
    }

    fn ignores_child_failures(&self) -> bool {
        self.ignores_child_failures
    }

    fn handle_listener_panic(&self, panic: Cause) {
        self.listener_panics.lock().unwrap().push(panic);
    }
}

/// A shared invocation counter plus the cause it last saw.
#[derive(Debug, Default)]
pub struct HandlerProbe {
    pub hits: AtomicUsize,
    pub saw_cause: AtomicBool,
}

impl HandlerProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn handler(self: &Arc<Self>) -> impl Fn(Option<&Cause>) + Send + Sync + 'static {
        let probe = Arc::clone(self);
        move |cause| {
            probe.hits.fetch_add(1, Ordering::SeqCst);
            if cause.is_some() {
                probe.saw_cause.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log test completion.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Standard per-test setup.
pub fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}
