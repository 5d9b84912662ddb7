//! Error and signal types shared across the crate.
//!
//! Two families live here. `Cancelled` is a *control* signal: it is how
//! scope cancellation surfaces to awaiters and listeners, and it is meant
//! to be absorbed by [`Scope::catch_cancellations`][crate::Scope]. Everything
//! else is an ordinary error. Programmer faults (binding to a cancelled
//! scope, listening twice to a single-subscription source, merging zero
//! sources) are not represented here at all: they panic synchronously at
//! the offending call site and are never absorbable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identity of a [`Scope`][crate::Scope].
///
/// Scope ids are process-unique and never reused. Cancellation signals are
/// stamped with the id of the scope that produced them, which is how the
/// cancellation filter tells "my" cancellations from foreign ones without
/// holding a reference back to the scope itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ScopeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// A pass-through error payload.
///
/// Source errors are forwarded by reference, never copied or rewrapped, so
/// the original error (and its `source()` chain) survives fan-out to any
/// number of broadcast listeners.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The cancellation signal delivered to work bound to a cancelled scope.
///
/// Awaiting a [`BoundFuture`][crate::BoundFuture] after its scope cancelled
/// rejects with this; listeners of a bound source observe it as the final
/// error event before the stream closes. Two signals compare equal exactly
/// when they originate from the same scope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task bound to {scope} was cancelled")]
pub struct Cancelled {
    scope: ScopeId,
}

impl Cancelled {
    pub(crate) fn new(scope: ScopeId) -> Self {
        Cancelled { scope }
    }

    /// Identity of the scope that issued this signal.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }
}

impl PartialEq for Cancelled {
    fn eq(&self, other: &Self) -> bool {
        self.scope == other.scope
    }
}

impl Eq for Cancelled {}

/// The error channel of an event source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    /// The owning scope cancelled the work feeding this source.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// An error produced by the source itself, delivered unmodified.
    #[error("{0}")]
    Source(SharedError),

    /// An error from one input of a merged source, wrapped with the index
    /// of that input in the user-declared order.
    #[error("merge input {index} failed: {source}")]
    MergeInput {
        /// Position of the failing source in the declared input list.
        index: usize,
        /// The failing source's original error.
        #[source]
        source: Box<EventError>,
    },
}

/// Structural equality; pass-through payloads compare by identity (the
/// same `Arc`), which is also how "the original error was preserved" is
/// asserted in tests.
impl PartialEq for EventError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EventError::Cancelled(a), EventError::Cancelled(b)) => a == b,
            (EventError::Source(a), EventError::Source(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (
                EventError::MergeInput {
                    index: a,
                    source: sa,
                },
                EventError::MergeInput {
                    index: b,
                    source: sb,
                },
            ) => a == b && sa == sb,
            _ => false,
        }
    }
}

impl EventError {
    /// Wraps an arbitrary error for delivery through a source's error
    /// channel.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EventError::Source(Arc::new(error))
    }

    /// The cancellation signal carried by this error, if it is one, looking
    /// through merge wrapping.
    pub fn as_cancellation(&self) -> Option<&Cancelled> {
        match self {
            EventError::Cancelled(signal) => Some(signal),
            EventError::MergeInput { source, .. } => source.as_cancellation(),
            EventError::Source(_) => None,
        }
    }
}
