//! Helpers shared by the unit and scenario tests.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use futures::Stream;

use crate::error::EventError;
use crate::subscription::Subscription;

/// A context whose waker does nothing; polls are driven by hand.
pub(crate) fn noop_context() -> Context<'static> {
    Context::from_waker(noop_waker_ref())
}

/// Collects every event of a subscription whose source is already fully
/// buffered. Panics on an unexpected `Pending`.
pub(crate) fn drain_now<T: Clone + Send + 'static>(
    mut subscription: Subscription<T>,
) -> Vec<Result<T, EventError>> {
    let mut cx = noop_context();
    let mut events = Vec::new();
    loop {
        match Pin::new(&mut subscription).poll_next(&mut cx) {
            Poll::Ready(Some(event)) => events.push(event),
            Poll::Ready(None) => return events,
            Poll::Pending => panic!("subscription unexpectedly pending"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("boom")]
pub(crate) struct Boom;
