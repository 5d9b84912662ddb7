//! The lifecycle transformer framework.
//!
//! A [`LifecycleTransformer`] turns one [`EventSource`] into another while
//! preserving the source's semantics by default: data, errors with their
//! original payloads, the done signal, pause/resume forwarding,
//! single-subscription enforcement, and kind-matched destinations
//! (broadcast in, broadcast out). Every lifecycle moment is an overridable
//! hook, so a transformer only writes the parts it wants to change.
//! [`on_source_item`][LifecycleTransformer::on_source_item] is the one
//! hook without a default, since the output event type differs from the
//! input's.
//!
//! The engine is pull-driven. [`EventSource::transform`] asks the
//! transformer for a destination controller, then installs a *pump*
//! (the transformer plus the current upstream subscription) inside the
//! destination's shared state. Polling a destination subscriber drains
//! its queue and otherwise advances the pump, which polls the upstream
//! subscription once and routes the event through the hooks. Destination
//! lifecycle transitions (first listen, cancel, pause edges) are routed
//! to the corresponding hooks synchronously on the stack that caused
//! them.

use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;

use crate::controller::SourceController;
use crate::error::EventError;
use crate::source::{EventSource, SourceKind};
use crate::state::{Pump, PumpTick, Shared};
use crate::subscription::Subscription;

/// The state a hook may act on, re-borrowed fresh for every call.
pub struct TransformerContext<'a, In, Out> {
    /// The source being transformed.
    pub source: &'a EventSource<In>,
    /// The current upstream subscription, if listening.
    pub subscription: &'a mut Option<Subscription<In>>,
    /// The destination controller produced by
    /// [`bind_destination`][LifecycleTransformer::bind_destination].
    pub destination: &'a SourceController<Out>,
}

/// An overridable source-to-source adapter; see the module docs.
pub trait LifecycleTransformer<In, Out>: Send + 'static
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    /// Chooses the destination controller. The default matches the source
    /// kind. Overriding this is how a transformer routes several sources
    /// into one shared destination.
    fn bind_destination(&mut self, source: &EventSource<In>) -> SourceController<Out> {
        match source.kind() {
            SourceKind::SingleSubscription => SourceController::new(),
            SourceKind::Broadcast => SourceController::broadcast(),
        }
    }

    /// Runs when the destination gains its (first) listener. The returned
    /// subscription becomes the context's current subscription. The
    /// default subscribes to the source with `cancel_on_error` off.
    fn on_dest_listen(
        &mut self,
        cx: &mut TransformerContext<'_, In, Out>,
    ) -> Option<Subscription<In>> {
        Some(cx.source.subscribe())
    }

    /// Runs when the destination loses its last listener. The default
    /// cancels the upstream subscription and, only when the source is
    /// single-subscription, closes the destination; a broadcast
    /// destination stays open for future listeners. The return value
    /// becomes the new current subscription.
    fn on_dest_cancel(
        &mut self,
        cx: &mut TransformerContext<'_, In, Out>,
    ) -> Option<Subscription<In>> {
        if let Some(subscription) = cx.subscription.take() {
            subscription.cancel();
        }
        if cx.source.kind() == SourceKind::SingleSubscription && !cx.destination.is_closed() {
            cx.destination.close();
        }
        None
    }

    /// Runs when the destination subscription enters the paused state.
    /// The default forwards the pause upstream.
    fn on_dest_pause(&mut self, cx: &mut TransformerContext<'_, In, Out>) {
        if let Some(subscription) = cx.subscription.as_ref() {
            subscription.pause();
        }
    }

    /// Runs when the destination subscription leaves the paused state.
    fn on_dest_resume(&mut self, cx: &mut TransformerContext<'_, In, Out>) {
        if let Some(subscription) = cx.subscription.as_ref() {
            subscription.resume();
        }
    }

    /// Handles one source data event. No default is possible: the
    /// destination event type differs from the source's.
    fn on_source_item(&mut self, cx: &mut TransformerContext<'_, In, Out>, item: In);

    /// Handles a source error. The default forwards it through the
    /// destination's error channel, payload untouched.
    fn on_source_error(&mut self, cx: &mut TransformerContext<'_, In, Out>, error: EventError) {
        cx.destination.push_error(error);
    }

    /// Handles the source's done signal. The default closes the
    /// destination if it is still open.
    fn on_source_done(&mut self, cx: &mut TransformerContext<'_, In, Out>) {
        if !cx.destination.is_closed() {
            cx.destination.close();
        }
    }
}

impl<T: Clone + Send + 'static> EventSource<T> {
    /// Produces the transformed source.
    ///
    /// Nothing is subscribed until the returned source gains a listener.
    pub fn transform<Out, X>(&self, mut transformer: X) -> EventSource<Out>
    where
        Out: Clone + Send + 'static,
        X: LifecycleTransformer<T, Out>,
    {
        let destination = transformer.bind_destination(self);
        let output = destination.source();
        // The pump lives inside the destination's shared state, so it
        // holds its destination weakly; the strong references are the
        // handles users keep.
        output.shared().attach_pump(Box::new(TransformPump {
            source: self.clone(),
            subscription: None,
            destination: Arc::downgrade(output.shared()),
            transformer,
        }));
        output
    }
}

struct TransformPump<In, Out, X> {
    source: EventSource<In>,
    subscription: Option<Subscription<In>>,
    destination: Weak<Shared<Out>>,
    transformer: X,
}

// One source event is dispatched per tick: the destination queue grows
// only as fast as its consumer drains it, so an always-ready upstream
// cannot flood the buffer.
impl<In, Out, X> Pump for TransformPump<In, Out, X>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
    X: LifecycleTransformer<In, Out>,
{
    fn tick(&mut self, cx: &mut Context<'_>) -> PumpTick {
        let destination = match self.destination.upgrade() {
            Some(shared) => SourceController::from_shared(shared),
            None => return PumpTick::Done,
        };
        if destination.is_closed() {
            return PumpTick::Done;
        }
        let polled = match self.subscription.as_mut() {
            None => return PumpTick::Pending,
            Some(subscription) => std::pin::Pin::new(subscription).poll_next(cx),
        };
        match polled {
            Poll::Pending => PumpTick::Pending,
            Poll::Ready(Some(Ok(item))) => {
                self.transformer.on_source_item(
                    &mut TransformerContext {
                        source: &self.source,
                        subscription: &mut self.subscription,
                        destination: &destination,
                    },
                    item,
                );
                PumpTick::Progress
            }
            Poll::Ready(Some(Err(error))) => {
                self.transformer.on_source_error(
                    &mut TransformerContext {
                        source: &self.source,
                        subscription: &mut self.subscription,
                        destination: &destination,
                    },
                    error,
                );
                PumpTick::Progress
            }
            Poll::Ready(None) => {
                self.subscription = None;
                self.transformer.on_source_done(&mut TransformerContext {
                    source: &self.source,
                    subscription: &mut self.subscription,
                    destination: &destination,
                });
                PumpTick::Done
            }
        }
    }

    fn dest_listened(&mut self) {
        let destination = match self.destination.upgrade() {
            Some(shared) => SourceController::from_shared(shared),
            None => return,
        };
        let returned = self.transformer.on_dest_listen(&mut TransformerContext {
            source: &self.source,
            subscription: &mut self.subscription,
            destination: &destination,
        });
        self.subscription = returned;
    }

    fn dest_cancelled(&mut self) {
        let destination = match self.destination.upgrade() {
            Some(shared) => SourceController::from_shared(shared),
            None => return,
        };
        let returned = self.transformer.on_dest_cancel(&mut TransformerContext {
            source: &self.source,
            subscription: &mut self.subscription,
            destination: &destination,
        });
        self.subscription = returned;
    }

    fn dest_paused(&mut self) {
        let destination = match self.destination.upgrade() {
            Some(shared) => SourceController::from_shared(shared),
            None => return,
        };
        self.transformer.on_dest_pause(&mut TransformerContext {
            source: &self.source,
            subscription: &mut self.subscription,
            destination: &destination,
        });
    }

    fn dest_resumed(&mut self) {
        let destination = match self.destination.upgrade() {
            Some(shared) => SourceController::from_shared(shared),
            None => return,
        };
        self.transformer.on_dest_resume(&mut TransformerContext {
            source: &self.source,
            subscription: &mut self.subscription,
            destination: &destination,
        });
    }
}

/// Passes every event through unchanged.
pub struct IdentityTransformer;

impl<T: Clone + Send + 'static> LifecycleTransformer<T, T> for IdentityTransformer {
    fn on_source_item(&mut self, cx: &mut TransformerContext<'_, T, T>, item: T) {
        cx.destination.push(item);
    }
}

/// Maps each data event through a function; everything else follows the
/// defaults.
pub struct MapTransformer<F> {
    map: F,
}

impl<F> MapTransformer<F> {
    pub fn new(map: F) -> Self {
        MapTransformer { map }
    }
}

impl<In, Out, F> LifecycleTransformer<In, Out> for MapTransformer<F>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
    F: FnMut(In) -> Out + Send + 'static,
{
    fn on_source_item(&mut self, cx: &mut TransformerContext<'_, In, Out>, item: In) {
        cx.destination.push((self.map)(item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{drain_now, noop_context, Boom};
    use crate::SourceController;
    use std::pin::Pin;

    #[test]
    fn identity_round_trips_all_values() {
        let source = EventSource::from_iter(vec![1, 2, 3, 4]);
        let out = source.transform(IdentityTransformer);
        assert_eq!(
            drain_now(out.subscribe()),
            vec![Ok(1), Ok(2), Ok(3), Ok(4)]
        );
    }

    #[test]
    fn map_rewrites_items_only() {
        let controller = SourceController::<i32>::new();
        let source = controller.source();
        let boom = EventError::failed(Boom);
        controller.push(2);
        controller.push_error(boom.clone());
        controller.push(3);
        controller.close();

        let out = source.transform(MapTransformer::new(|v: i32| v * 10));
        let events = drain_now(out.subscribe());
        assert_eq!(events, vec![Ok(20), Err(boom), Ok(30)]);
    }

    #[test]
    fn errors_forward_with_the_original_payload() {
        let controller = SourceController::<i32>::new();
        let source = controller.source();
        let boom = EventError::failed(Boom);
        controller.push_error(boom.clone());
        controller.close();

        let out = source.transform(IdentityTransformer);
        let events = drain_now(out.subscribe());
        // Identity of the payload, not just of the message.
        assert_eq!(events, vec![Err(boom)]);
    }

    #[test]
    fn nothing_subscribes_upstream_until_the_destination_is_listened() {
        let controller = SourceController::<i32>::new();
        let source = controller.source();
        let out = source.transform(IdentityTransformer);
        assert!(!controller.has_listener());
        let _sub = out.subscribe();
        assert!(controller.has_listener());
    }

    #[test]
    fn cancelling_the_destination_cancels_upstream_and_closes() {
        let controller = SourceController::<i32>::new();
        let source = controller.source();
        let out = source.transform(IdentityTransformer);
        let sub = out.subscribe();
        sub.cancel();
        assert!(!controller.has_listener());
        assert!(out.shared().is_closed());
    }

    #[test]
    fn broadcast_destination_survives_listener_turnover() {
        let controller = SourceController::broadcast();
        let source = controller.source();
        let out = source.transform(IdentityTransformer);
        assert_eq!(out.kind(), SourceKind::Broadcast);

        let first = out.subscribe();
        first.cancel();
        // Still open: a broadcast destination outlives its listeners.
        assert!(!out.shared().is_closed());

        let mut second = out.subscribe();
        controller.push(5);
        let mut cx = noop_context();
        assert_eq!(
            Pin::new(&mut second).poll_next(&mut cx),
            std::task::Poll::Ready(Some(Ok(5)))
        );
    }

    #[test]
    fn pause_propagates_to_the_source_subscription() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let pauses = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pauses);
        let controller = SourceController::<i32>::builder()
            .on_pause(move || {
                p.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let out = controller.source().transform(IdentityTransformer);
        let sub = out.subscribe();
        sub.pause();
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
        sub.resume();
    }

    #[test]
    #[should_panic(expected = "already has a listener")]
    fn transformed_single_subscription_source_rejects_a_second_listener() {
        let source = EventSource::from_iter(vec![1]);
        let out = source.transform(IdentityTransformer);
        let _first = out.subscribe();
        let _second = out.subscribe();
    }
}
