//! Jobtree: the job state machine of a structured-concurrency runtime.
//!
//! # Overview
//!
//! A [`Job`] is a cancelable, observable unit of concurrent work organized
//! in a parent/child tree. The crate implements the lifecycle core only:
//! state transitions, listener phases, failure aggregation, and the
//! structured completion protocol. Scheduling, I/O, and suspension plumbing
//! beyond `std::future` belong to the embedding runtime.
//!
//! # Core guarantees
//!
//! - **Linearizable transitions**: any number of threads may call any
//!   operation; every state change is a compare-and-swap, retried on loss.
//! - **Structured completion**: a parent never reaches a terminal state
//!   before all of its attached children.
//! - **Exactly-once notification**: listeners fire at most once, in
//!   registration order, in well-defined phases; the cancelling phase
//!   precedes the terminal phase.
//! - **Cancellation is not failure**: cancellation causes propagate down the
//!   tree but are never reported upward as errors; real failures cancel the
//!   parent unless it supervises.
//!
//! # Module structure
//!
//! - [`cause`]: the cancellation/failure taxonomy
//! - [`state`]: state variants and the atomic lifecycle mirror
//! - [`job`]: the state machine, hooks, and the public [`Job`] handle
//! - [`child`]: parent/child handles and listener disposal
//! - [`deferred`]: jobs completing with a typed value
//! - [`wait`]: join/await suspension adapters
//! - [`select`]: selectable clauses over completion events
//!
//! # Example
//!
//! ```
//! use jobtree::{Cause, Job};
//!
//! let parent = Job::new(None);
//! let child = Job::new(Some(&parent));
//!
//! child.complete_exceptionally(Cause::failure_msg("worker failed"));
//! assert!(parent.is_cancelled());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cause;
pub mod child;
pub mod deferred;
mod finishing;
pub mod job;
mod list;
pub mod select;
pub mod state;
#[cfg(test)]
mod test_utils;
pub mod wait;

pub use cause::{CancelKind, Cause, NotActiveError, StateError};
pub use child::{ChildHandle, Disposable};
pub use deferred::CompletableDeferred;
pub use job::{Job, JobHooks, JobId};
pub use select::{OnAwait, OnJoin, SelectClaim};
pub use state::{CompletionValue, Lifecycle, Terminal};
pub use wait::{AwaitFuture, JoinFuture};
