//! Scopes: the cancellation cut point.
//!
//! A [`Scope`] owns a set of cancellable task handles and an ordered list
//! of child scopes. [`cancel_all`][Scope::cancel_all] is synchronous by
//! design: when it returns on the calling stack, every handle has been
//! flipped to its terminal cancelled state, every child has been
//! cancelled, and [`is_cancelled`][Scope::is_cancelled] reads true. Code
//! running after the call can rely on no bound work resuming with a
//! value.

use std::sync::{Arc, Mutex, Weak};

use slab::Slab;

use crate::error::{Cancelled, ScopeId};

pub(crate) const SCOPE_CANCELLED: &str =
    "scope already cancelled: it no longer accepts bound work";

pub(crate) type CancelAction = Box<dyn FnOnce(Cancelled) + Send>;

enum Phase {
    Active,
    /// A cancel pass is running on some stack below us.
    Cancelling,
    Cancelled,
}

struct ScopeState {
    phase: Phase,
    handles: Slab<CancelAction>,
    children: Vec<Scope>,
}

pub(crate) struct ScopeInner {
    id: ScopeId,
    state: Mutex<ScopeState>,
}

impl ScopeInner {
    /// Forgets a handle that completed on its own. Quietly does nothing
    /// during or after a cancel pass, when the handle set is already
    /// drained.
    pub(crate) fn release(&self, key: usize) {
        let mut state = self.state.lock().unwrap();
        if let Phase::Active = state.phase {
            state.handles.try_remove(key);
        }
    }
}

/// A group of asynchronous work with one cancellation cut point.
///
/// Handles are cheap to clone; clones refer to the same scope. Work is
/// attached with [`bind_future`][Scope::bind_future],
/// [`bind_source`][Scope::bind_source] and
/// [`add_cancel_listener`][Scope::add_cancel_listener]; none of these
/// suspend. A scope may own child scopes, cancelled after the parent's
/// own handles; children never reach back to their parent.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub fn new() -> Self {
        let id = ScopeId::next();
        tracing::trace!(scope = %id, "scope created");
        Scope {
            inner: Arc::new(ScopeInner {
                id,
                state: Mutex::new(ScopeState {
                    phase: Phase::Active,
                    handles: Slab::new(),
                    children: Vec::new(),
                }),
            }),
        }
    }

    /// Creates a child scope, cancelled when this scope cancels (after
    /// this scope's own handles). Cancelling the child leaves the parent
    /// untouched.
    ///
    /// Panics if this scope has already cancelled; a child of a dead
    /// scope could never be cancelled through it.
    pub fn child(&self) -> Scope {
        let child = Scope::new();
        let cancelled = {
            let mut state = self.inner.state.lock().unwrap();
            match state.phase {
                Phase::Cancelled => true,
                Phase::Active | Phase::Cancelling => {
                    state.children.push(child.clone());
                    false
                }
            }
        };
        if cancelled {
            panic!("{}", SCOPE_CANCELLED);
        }
        tracing::trace!(parent = %self.inner.id, child = %child.inner.id, "child scope attached");
        child
    }

    /// This scope's stable identity; cancellation signals carry it.
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.state.lock().unwrap().phase,
            Phase::Cancelled
        )
    }

    /// Cancels every handle bound to this scope, then every child scope
    /// in creation order, then marks the scope cancelled.
    ///
    /// Synchronous and idempotent: it never suspends, and once it returns
    /// every awaiter of a bound future is guaranteed to reject rather
    /// than resume with a value. The handle set is snapshotted up front;
    /// handles added from within a cancel callback are not visited.
    /// Cancel callbacks run on this stack and must not block on the
    /// scope's own work.
    pub fn cancel_all(&self) {
        let (actions, children) = {
            let mut state = self.inner.state.lock().unwrap();
            match state.phase {
                Phase::Active => {}
                Phase::Cancelling | Phase::Cancelled => return,
            }
            state.phase = Phase::Cancelling;
            let actions: Vec<CancelAction> = state.handles.drain().collect();
            let children = state.children.clone();
            (actions, children)
        };
        tracing::debug!(
            scope = %self.inner.id,
            handles = actions.len(),
            children = children.len(),
            "cancelling scope"
        );
        let signal = Cancelled::new(self.inner.id);
        for action in actions {
            action(signal.clone());
        }
        for child in &children {
            child.cancel_all();
        }
        self.inner.state.lock().unwrap().phase = Phase::Cancelled;
    }

    /// Registers a callback to run when this scope cancels.
    ///
    /// The callback runs exactly once across
    /// [`invoke_early`][CancelListener::invoke_early] and
    /// [`cancel_all`][Scope::cancel_all], whichever comes first.
    ///
    /// Panics if the scope has already cancelled.
    pub fn add_cancel_listener<F>(&self, callback: F) -> CancelListener
    where
        F: FnOnce() + Send + 'static,
    {
        let cell: CallbackCell = Arc::new(Mutex::new(Some(Box::new(callback))));
        let action_cell = Arc::clone(&cell);
        let key = self.register(Box::new(move |_signal| {
            let taken = action_cell.lock().unwrap().take();
            if let Some(callback) = taken {
                callback();
            }
        }));
        CancelListener {
            scope: Arc::downgrade(&self.inner),
            key,
            callback: cell,
        }
    }

    /// Adds a cancel action; panics once the scope has cancelled. During
    /// a cancel pass the set was already snapshotted, so the new handle
    /// is never visited; binding from inside a cancel callback is not
    /// something to rely on.
    pub(crate) fn register(&self, action: CancelAction) -> usize {
        let key = {
            let mut state = self.inner.state.lock().unwrap();
            match state.phase {
                Phase::Cancelled => None,
                Phase::Active | Phase::Cancelling => Some(state.handles.insert(action)),
            }
        };
        match key {
            Some(key) => key,
            None => panic!("{}", SCOPE_CANCELLED),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ScopeInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

type CallbackCell = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

/// Handle to a callback registered with
/// [`Scope::add_cancel_listener`].
pub struct CancelListener {
    scope: Weak<ScopeInner>,
    key: usize,
    callback: CallbackCell,
}

impl CancelListener {
    /// Runs the callback now instead of at cancellation, and forgets the
    /// handle. Idempotent; a no-op once the callback has run, including
    /// when the scope's cancellation already ran it.
    pub fn invoke_early(&self) {
        let taken = self.callback.lock().unwrap().take();
        if let Some(callback) = taken {
            callback();
            if let Some(inner) = self.scope.upgrade() {
                inner.release(self.key);
            }
        }
    }

    /// Whether the callback has already run, either way.
    pub fn has_fired(&self) -> bool {
        self.callback.lock().unwrap().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_all_is_idempotent() {
        let scope = Scope::new();
        assert!(!scope.is_cancelled());
        scope.cancel_all();
        scope.cancel_all();
        assert!(scope.is_cancelled());
    }

    #[test]
    fn parent_cancel_reaches_children_in_order() {
        let parent = Scope::new();
        let first = parent.child();
        let second = parent.child();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        first.add_cancel_listener(move || o1.lock().unwrap().push("first"));
        second.add_cancel_listener(move || o2.lock().unwrap().push("second"));

        parent.cancel_all();
        assert!(parent.is_cancelled());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn child_cancel_leaves_parent_untouched() {
        let parent = Scope::new();
        let child = parent.child();
        child.cancel_all();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    #[should_panic(expected = "already cancelled")]
    fn child_of_a_cancelled_scope_is_refused() {
        let scope = Scope::new();
        scope.cancel_all();
        let _child = scope.child();
    }

    #[test]
    fn cancel_listener_runs_exactly_once_via_cancel() {
        let scope = Scope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener = scope.add_cancel_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        scope.cancel_all();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listener.has_fired());
        listener.invoke_early();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_listener_runs_exactly_once_via_invoke_early() {
        let scope = Scope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener = scope.add_cancel_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listener.invoke_early();
        listener.invoke_early();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scope.cancel_all();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already cancelled")]
    fn listeners_cannot_be_added_after_cancel() {
        let scope = Scope::new();
        scope.cancel_all();
        scope.add_cancel_listener(|| {});
    }

    #[test]
    fn listeners_added_during_cancel_are_not_visited() {
        let scope = Scope::new();
        let late = Arc::new(AtomicUsize::new(0));
        let inner_scope = scope.clone();
        let late_for_cb = Arc::clone(&late);
        scope.add_cancel_listener(move || {
            let late = Arc::clone(&late_for_cb);
            inner_scope.add_cancel_listener(move || {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });
        scope.cancel_all();
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert!(scope.is_cancelled());
    }

    #[test]
    fn is_cancelled_flips_only_after_the_full_pass() {
        let scope = Scope::new();
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        let s = scope.clone();
        scope.add_cancel_listener(move || {
            *o.lock().unwrap() = Some(s.is_cancelled());
        });
        scope.cancel_all();
        // During the pass the scope still read as not-yet-cancelled.
        assert_eq!(*observed.lock().unwrap(), Some(false));
        assert!(scope.is_cancelled());
    }
}
