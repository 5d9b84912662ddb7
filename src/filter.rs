//! Absorbing cancellation signals: a try/catch for cancellation.
//!
//! There is no dynamic error context to install a handler into; instead,
//! every outcome of the guarded block flows through one join point that
//! inspects error identity before surfacing. A cancellation matching the
//! predicate is absorbed, so the caller sees a normal completion with no
//! value; everything else, foreign-scope cancellations included,
//! propagates untouched. Panics are programmer faults and are never
//! caught.

use std::future::Future;

use crate::error::{Cancelled, EventError};
use crate::scope::Scope;

/// Errors that may carry a cancellation signal.
///
/// Implemented by [`Cancelled`] itself and by [`EventError`]; implement
/// it for your own error types to use them with the catch combinators.
pub trait AsCancellation {
    /// The cancellation signal inside this error, if any.
    fn as_cancellation(&self) -> Option<&Cancelled>;
}

impl AsCancellation for Cancelled {
    fn as_cancellation(&self) -> Option<&Cancelled> {
        Some(self)
    }
}

impl AsCancellation for EventError {
    fn as_cancellation(&self) -> Option<&Cancelled> {
        EventError::as_cancellation(self)
    }
}

impl Scope {
    /// Runs `block`, absorbing cancellations issued by *this* scope.
    ///
    /// `Ok(Some(value))` when the block completes; `Ok(None)` when it
    /// failed with this scope's cancellation signal; `Err` with the
    /// original error for anything else, including cancellations
    /// stamped by other scopes.
    pub async fn catch_cancellations<T, E, F>(&self, block: F) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
        E: AsCancellation,
    {
        let own = self.id();
        Scope::catch_cancellations_matching(block, move |signal| signal.scope() == own).await
    }

    /// Runs `block`, absorbing cancellations from any scope.
    pub async fn catch_all_cancellations<T, E, F>(block: F) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
        E: AsCancellation,
    {
        Scope::catch_cancellations_matching(block, |_| true).await
    }

    /// Runs `block`, absorbing cancellations the predicate accepts.
    pub async fn catch_cancellations_matching<T, E, F, P>(
        block: F,
        predicate: P,
    ) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
        E: AsCancellation,
        P: Fn(&Cancelled) -> bool,
    {
        match block.await {
            Ok(value) => Ok(Some(value)),
            Err(error) => match error.as_cancellation() {
                Some(signal) if predicate(signal) => Ok(None),
                _ => Err(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn own_cancellations_are_absorbed() {
        let scope = Scope::new();
        let bound = scope.bind_future(futures::future::pending::<()>());
        scope.cancel_all();
        let outcome = block_on(scope.catch_cancellations(bound));
        assert_eq!(outcome, Ok(None));
    }

    #[test]
    fn foreign_cancellations_rethrow() {
        let own = Scope::new();
        let other = Scope::new();
        let bound = other.bind_future(futures::future::pending::<()>());
        other.cancel_all();
        let outcome = block_on(own.catch_cancellations(bound));
        assert_eq!(outcome, Err(crate::Cancelled::new(other.id())));
    }

    #[test]
    fn catch_all_absorbs_any_scope() {
        let other = Scope::new();
        let bound = other.bind_future(futures::future::pending::<()>());
        other.cancel_all();
        let outcome = block_on(Scope::catch_all_cancellations(bound));
        assert_eq!(outcome, Ok(None));
    }

    #[test]
    fn normal_completions_pass_through() {
        let scope = Scope::new();
        let bound = scope.bind_future(futures::future::ready(3));
        let outcome = block_on(scope.catch_cancellations(bound));
        assert_eq!(outcome, Ok(Some(3)));
    }

    #[test]
    fn predicates_choose_what_to_absorb() {
        let a = Scope::new();
        let b = Scope::new();
        let bound = a.bind_future(futures::future::pending::<()>());
        a.cancel_all();

        let a_id = a.id();
        let outcome = block_on(Scope::catch_cancellations_matching(bound, move |signal| {
            signal.scope() == a_id
        }));
        assert_eq!(outcome, Ok(None));

        let bound_b = b.bind_future(futures::future::pending::<()>());
        b.cancel_all();
        let outcome = block_on(Scope::catch_cancellations_matching(bound_b, move |signal| {
            signal.scope() == a_id
        }));
        assert_eq!(outcome, Err(crate::Cancelled::new(b.id())));
    }
}
