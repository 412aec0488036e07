//! Cancellation and failure causes.
//!
//! Termination of a job is always attributed to a [`Cause`]. Causes come in
//! three flavors:
//!
//! - **Cancellation**: a "normal" termination signal. Never reported as an
//!   error by the parent-propagation path.
//! - **Failure**: any other error. Cancels the parent unless the parent is a
//!   supervisor.
//! - **Handler panic**: wraps a panic raised *by* a completion listener.
//!   Never becomes the job's own cause; routed to the
//!   [`handle_listener_panic`](crate::JobHooks::handle_listener_panic) hook.
//!
//! A `Cause` is backed by an `Arc`, so clones share identity. Aggregation
//! during finalization deduplicates by that identity ([`Cause::same`]), which
//! is what lets the same cause travel down the tree and back up without being
//! double-counted.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The kind of a cancellation cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelKind {
    /// Explicit cancellation with no more specific origin.
    Default,
    /// Cancellation raised by a deadline or timeout facility.
    Timeout,
    /// Cancellation delivered to a child because its parent is cancelling.
    ParentCancelled,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timed out"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
        }
    }
}

#[derive(Debug)]
enum CauseRepr {
    Cancellation {
        kind: CancelKind,
        message: String,
        source: Option<Cause>,
    },
    Failure {
        error: Arc<dyn StdError + Send + Sync>,
    },
    HandlerPanic {
        message: String,
        suppressed: Vec<Cause>,
    },
}

/// Why a job terminated, or is terminating.
///
/// Cheap to clone; clones compare equal under [`Cause::same`] (identity).
#[derive(Clone)]
pub struct Cause {
    repr: Arc<CauseRepr>,
}

impl Cause {
    fn from_repr(repr: CauseRepr) -> Self {
        Self {
            repr: Arc::new(repr),
        }
    }

    /// A default cancellation cause.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::cancelled_with("job was cancelled")
    }

    /// A cancellation cause with an explicit message.
    #[must_use]
    pub fn cancelled_with(message: impl Into<String>) -> Self {
        Self::from_repr(CauseRepr::Cancellation {
            kind: CancelKind::Default,
            message: message.into(),
            source: None,
        })
    }

    /// A timeout cancellation cause.
    ///
    /// Each call produces a distinct identity; finalization prefers a
    /// second, distinct timeout instance over the first one recorded.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::from_repr(CauseRepr::Cancellation {
            kind: CancelKind::Timeout,
            message: message.into(),
            source: None,
        })
    }

    /// The cancellation delivered to a child when its parent is cancelling.
    ///
    /// `source` carries the parent's root cause when that cause was a
    /// failure; a parent cancelled by a plain cancellation hands the original
    /// cause to the child unchanged instead of going through here.
    #[must_use]
    pub fn parent_cancelled(source: Option<Cause>) -> Self {
        Self::from_repr(CauseRepr::Cancellation {
            kind: CancelKind::ParentCancelled,
            message: "parent job is cancelling".to_owned(),
            source,
        })
    }

    /// Wraps an arbitrary error as a failure cause.
    #[must_use]
    pub fn failure(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::from_repr(CauseRepr::Failure {
            error: Arc::new(error),
        })
    }

    /// A failure cause carrying only a message.
    #[must_use]
    pub fn failure_msg(message: impl Into<String>) -> Self {
        Self::failure(MessageError(message.into()))
    }

    /// Aggregates panics raised by completion listeners: the first panic is
    /// the cause, later ones ride along as suppressed causes.
    #[must_use]
    pub(crate) fn handler_panic(message: String, suppressed: Vec<Cause>) -> Self {
        Self::from_repr(CauseRepr::HandlerPanic {
            message,
            suppressed,
        })
    }

    /// Extracts a displayable message from a caught panic payload.
    pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "listener panicked with a non-string payload".to_owned()
        }
    }

    /// Returns true if the two causes are the same instance.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.repr, &other.repr)
    }

    /// Returns true if this cause is a cancellation (of any kind).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(&*self.repr, CauseRepr::Cancellation { .. })
    }

    /// Returns true if this cause is a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(&*self.repr, CauseRepr::Failure { .. })
    }

    /// Returns true if this cause wraps a listener panic.
    #[must_use]
    pub fn is_handler_panic(&self) -> bool {
        matches!(&*self.repr, CauseRepr::HandlerPanic { .. })
    }

    /// The cancellation kind, if this is a cancellation.
    #[must_use]
    pub fn cancel_kind(&self) -> Option<CancelKind> {
        match &*self.repr {
            CauseRepr::Cancellation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Suppressed causes attached to this one (handler-panic aggregate).
    #[must_use]
    pub fn suppressed(&self) -> &[Cause] {
        match &*self.repr {
            CauseRepr::HandlerPanic { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Presents an arbitrary cause as a cancellation, wrapping failures.
    ///
    /// Used when a caller asks for the cancellation view of a job that
    /// failed: the failure becomes the source of a default cancellation.
    #[must_use]
    pub(crate) fn cancellation_wrapping(source: Cause) -> Self {
        if source.is_cancellation() {
            return source;
        }
        Self::from_repr(CauseRepr::Cancellation {
            kind: CancelKind::Default,
            message: "job was cancelled".to_owned(),
            source: Some(source),
        })
    }

    /// The failure that triggered this cancellation, if one did.
    #[must_use]
    pub fn source_cause(&self) -> Option<&Cause> {
        match &*self.repr {
            CauseRepr::Cancellation { source, .. } => source.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.repr {
            CauseRepr::Cancellation { message, .. } => write!(f, "{message}"),
            CauseRepr::Failure { error } => write!(f, "{error}"),
            CauseRepr::HandlerPanic { message, .. } => {
                write!(f, "completion listener panicked: {message}")
            }
        }
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.repr {
            CauseRepr::Cancellation { kind, message, .. } => f
                .debug_struct("Cancellation")
                .field("kind", kind)
                .field("message", message)
                .finish_non_exhaustive(),
            CauseRepr::Failure { error } => {
                f.debug_tuple("Failure").field(&error.to_string()).finish()
            }
            CauseRepr::HandlerPanic {
                message,
                suppressed,
            } => f
                .debug_struct("HandlerPanic")
                .field("message", message)
                .field("suppressed", &suppressed.len())
                .finish(),
        }
    }
}

impl StdError for Cause {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &*self.repr {
            CauseRepr::Cancellation {
                source: Some(inner),
                ..
            } => Some(inner),
            CauseRepr::Failure { error } => error.source(),
            _ => None,
        }
    }
}

/// A string-only failure payload.
#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for MessageError {}

/// Why [`ensure_active`](crate::Job::ensure_active) found the job inactive.
///
/// Only the `Cancelled` variant carries a cancellation; a job that finished
/// normally or was never started is not misreported as cancelled.
#[derive(Debug, Clone, Error)]
pub enum NotActiveError {
    /// The job was created lazily and has not been started.
    #[error("job has not been started")]
    NotStarted,
    /// The job is cancelling or was cancelled; the source says why.
    #[error("job is cancelled")]
    Cancelled(#[source] Cause),
    /// The job already completed normally.
    #[error("job has completed")]
    Completed,
}

/// Errors returned by state queries on a job or deferred value.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// The job has not reached a terminal state yet.
    #[error("job has not completed")]
    Incomplete,
    /// The job completed exceptionally instead of producing a value.
    #[error("job completed exceptionally")]
    Failed(#[source] Cause),
    /// The stored completion value has a different type than requested.
    #[error("completion value has an unexpected type")]
    ValueType,
}
