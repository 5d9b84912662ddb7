//! Scope-bound work: one-shot futures and event sources.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use pin_project::{pin_project, pinned_drop};

use crate::error::Cancelled;
use crate::scope::{Scope, ScopeInner};
use crate::source::{EventSource, SourceKind};
use crate::subscription::Subscription;
use crate::transformer::{LifecycleTransformer, TransformerContext};

/// The bridge between a bound future and its scope: a one-shot state
/// machine whose first terminal transition wins. The scope's cancel
/// action flips it to `Cancelled` synchronously; the future's poll
/// checks it before *and after* polling the inner future, so a value
/// and a cancellation racing on different stacks resolve to whichever
/// transition published first.
enum Bridge {
    Pending(Option<Waker>),
    Finished,
    Cancelled(Cancelled),
}

impl Scope {
    /// Binds a one-shot computation to this scope.
    ///
    /// Registration is synchronous. Awaiting the returned future yields
    /// the inner future's output, unless the scope cancels first; then
    /// it rejects with the scope's [`Cancelled`] signal, and keeps doing
    /// so even if the inner computation had already produced a value
    /// that was still in flight (the value is discarded).
    ///
    /// Panics if the scope has already cancelled.
    pub fn bind_future<F: Future>(&self, future: F) -> BoundFuture<F> {
        let bridge = Arc::new(Mutex::new(Bridge::Pending(None)));
        let action_bridge = Arc::clone(&bridge);
        let key = self.register(Box::new(move |signal| {
            let waker = {
                let mut bridge = action_bridge.lock().unwrap();
                match &mut *bridge {
                    Bridge::Pending(waker) => {
                        let waker = waker.take();
                        *bridge = Bridge::Cancelled(signal);
                        waker
                    }
                    // The computation settled first; cancellation loses.
                    Bridge::Finished | Bridge::Cancelled(_) => None,
                }
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        BoundFuture {
            future,
            bridge,
            scope: self.downgrade(),
            key,
        }
    }

    /// Binds an event source to this scope.
    ///
    /// The returned source forwards every event of `source` unchanged
    /// until the scope cancels; listeners then observe exactly one
    /// [`Cancelled`] error followed by the end of the stream, and the
    /// upstream subscription is cancelled. Undelivered buffered events
    /// are discarded at that point. Cancelling the bound subscription
    /// yourself forwards the cancel upstream and releases the scope's
    /// handle.
    ///
    /// Panics if the scope has already cancelled.
    pub fn bind_source<T>(&self, source: &EventSource<T>) -> EventSource<T>
    where
        T: Clone + Send + 'static,
    {
        let key_cell = Arc::new(Mutex::new(None));
        let bound = source.transform(ScopeSourceTransformer {
            scope: self.downgrade(),
            key: Arc::clone(&key_cell),
        });
        let action_source = bound.clone();
        let key = self.register(Box::new(move |signal| {
            action_source.scope_cancel(signal);
        }));
        *key_cell.lock().unwrap() = Some(key);
        bound
    }
}

/// A one-shot computation bound to a [`Scope`].
///
/// Resolves to `Ok` with the inner future's output, or `Err` with the
/// scope's cancellation signal, whichever side reached the bridge first.
#[pin_project(PinnedDrop)]
pub struct BoundFuture<F: Future> {
    #[pin]
    future: F,
    bridge: Arc<Mutex<Bridge>>,
    scope: Weak<ScopeInner>,
    key: usize,
}

impl<F: Future> Future for BoundFuture<F> {
    type Output = Result<F::Output, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        {
            let bridge = this.bridge.lock().unwrap();
            match &*bridge {
                Bridge::Cancelled(signal) => return Poll::Ready(Err(signal.clone())),
                Bridge::Finished => panic!("BoundFuture polled after completion"),
                Bridge::Pending(_) => {}
            }
        }
        match this.future.poll(cx) {
            Poll::Ready(value) => {
                let won = {
                    let mut bridge = this.bridge.lock().unwrap();
                    match &*bridge {
                        // Cancellation published while the inner future
                        // ran; the value is discarded.
                        Bridge::Cancelled(signal) => Err(signal.clone()),
                        _ => {
                            *bridge = Bridge::Finished;
                            Ok(())
                        }
                    }
                };
                match won {
                    Err(signal) => Poll::Ready(Err(signal)),
                    Ok(()) => {
                        if let Some(inner) = this.scope.upgrade() {
                            inner.release(*this.key);
                        }
                        Poll::Ready(Ok(value))
                    }
                }
            }
            Poll::Pending => {
                let mut bridge = this.bridge.lock().unwrap();
                match &mut *bridge {
                    Bridge::Cancelled(signal) => Poll::Ready(Err(signal.clone())),
                    Bridge::Pending(waker) => {
                        *waker = Some(cx.waker().clone());
                        Poll::Pending
                    }
                    Bridge::Finished => panic!("BoundFuture polled after completion"),
                }
            }
        }
    }
}

#[pinned_drop]
impl<F: Future> PinnedDrop for BoundFuture<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let pending = matches!(*this.bridge.lock().unwrap(), Bridge::Pending(_));
        if pending {
            if let Some(inner) = this.scope.upgrade() {
                inner.release(*this.key);
            }
        }
    }
}

/// The bound-source lifecycle transformer: forwards data unchanged and
/// ties teardown to the owning scope. The scope-driven cancel path does
/// not go through the hooks at all: the scope's cancel action tears the
/// destination down directly, which also drops this transformer and its
/// upstream subscription.
struct ScopeSourceTransformer {
    scope: Weak<ScopeInner>,
    key: Arc<Mutex<Option<usize>>>,
}

impl ScopeSourceTransformer {
    /// Forgets the scope handle; once per binding.
    fn release(&self) {
        let key = self.key.lock().unwrap().take();
        if let (Some(key), Some(inner)) = (key, self.scope.upgrade()) {
            inner.release(key);
        }
    }
}

impl<T: Clone + Send + 'static> LifecycleTransformer<T, T> for ScopeSourceTransformer {
    fn on_source_item(&mut self, cx: &mut TransformerContext<'_, T, T>, item: T) {
        cx.destination.push(item);
    }

    fn on_dest_cancel(&mut self, cx: &mut TransformerContext<'_, T, T>) -> Option<Subscription<T>> {
        if let Some(subscription) = cx.subscription.take() {
            subscription.cancel();
        }
        if cx.source.kind() == SourceKind::SingleSubscription {
            if !cx.destination.is_closed() {
                cx.destination.close();
            }
            self.release();
        }
        None
    }

    fn on_source_done(&mut self, cx: &mut TransformerContext<'_, T, T>) {
        if !cx.destination.is_closed() {
            cx.destination.close();
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion;
    use crate::error::EventError;
    use crate::test_util::{drain_now, noop_context};
    use futures::Stream;

    #[test]
    fn bound_future_resolves_when_uncancelled() {
        let scope = Scope::new();
        let mut bound = Box::pin(scope.bind_future(futures::future::ready(42)));
        let mut cx = noop_context();
        assert_eq!(bound.as_mut().poll(&mut cx), Poll::Ready(Ok(42)));
    }

    #[test]
    fn cancellation_beats_a_value_still_in_flight() {
        let scope = Scope::new();
        let (completer, fut) = completion::<i32>();
        let mut bound = Box::pin(scope.bind_future(fut));
        let mut cx = noop_context();
        assert!(bound.as_mut().poll(&mut cx).is_pending());

        // The value settles, but the awaiter has not resumed yet when the
        // scope cancels: cancelled wins.
        completer.complete(5);
        scope.cancel_all();

        match bound.as_mut().poll(&mut cx) {
            Poll::Ready(Err(signal)) => assert_eq!(signal.scope(), scope.id()),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn value_delivered_before_cancel_stays_delivered() {
        let scope = Scope::new();
        let (completer, fut) = completion::<i32>();
        let mut bound = Box::pin(scope.bind_future(fut));
        let mut cx = noop_context();

        completer.complete(5);
        assert_eq!(bound.as_mut().poll(&mut cx), Poll::Ready(Ok(Ok(5))));
        // The handle was released; cancelling now touches nothing.
        scope.cancel_all();
    }

    #[test]
    #[should_panic(expected = "already cancelled")]
    fn binding_a_future_after_cancel_panics() {
        let scope = Scope::new();
        scope.cancel_all();
        let _bound = scope.bind_future(futures::future::ready(()));
    }

    #[test]
    #[should_panic(expected = "already cancelled")]
    fn binding_a_source_after_cancel_panics() {
        let scope = Scope::new();
        scope.cancel_all();
        let _bound = scope.bind_source(&EventSource::from_iter(vec![1]));
    }

    #[test]
    fn bound_source_forwards_until_cancel_then_one_signal_and_done() {
        let scope = Scope::new();
        let source = EventSource::from_iter(vec![1, 2, 3, 4]);
        let bound = scope.bind_source(&source);
        let mut sub = bound.subscribe();
        let mut cx = noop_context();

        assert_eq!(
            Pin::new(&mut sub).poll_next(&mut cx),
            Poll::Ready(Some(Ok(1)))
        );
        assert_eq!(
            Pin::new(&mut sub).poll_next(&mut cx),
            Poll::Ready(Some(Ok(2)))
        );

        scope.cancel_all();

        match Pin::new(&mut sub).poll_next(&mut cx) {
            Poll::Ready(Some(Err(EventError::Cancelled(signal)))) => {
                assert_eq!(signal.scope(), scope.id());
            }
            other => panic!("expected cancellation event, got {:?}", other),
        }
        assert_eq!(Pin::new(&mut sub).poll_next(&mut cx), Poll::Ready(None));
    }

    #[test]
    fn bound_source_completes_normally_when_uncancelled() {
        let scope = Scope::new();
        let source = EventSource::from_iter(vec![7, 8]);
        let bound = scope.bind_source(&source);
        assert_eq!(drain_now(bound.subscribe()), vec![Ok(7), Ok(8)]);
        // The source finished, so its handle is gone; cancel is a no-op
        // for it.
        scope.cancel_all();
    }

    #[test]
    fn cancelling_the_bound_subscription_cancels_upstream() {
        let scope = Scope::new();
        let controller = crate::SourceController::<i32>::new();
        let bound = scope.bind_source(&controller.source());
        let sub = bound.subscribe();
        assert!(controller.has_listener());
        sub.cancel();
        assert!(!controller.has_listener());
    }

    #[test]
    fn late_listener_of_a_cancelled_bound_source_sees_the_signal() {
        let scope = Scope::new();
        let bound = scope.bind_source(&EventSource::from_iter(vec![1]));
        scope.cancel_all();
        let events = drain_now(bound.subscribe());
        assert_eq!(
            events,
            vec![Err(EventError::Cancelled(Cancelled::new(scope.id())))]
        );
    }
}
