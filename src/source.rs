//! Source handles: the listen side of an event pipeline.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::Context;

use futures::Stream;

use crate::error::Cancelled;
use crate::state::{Pump, PumpTick, Shared, SharedRef};
use crate::subscription::{SubscribeOptions, Subscription};

/// Whether a source admits one subscriber or many.
///
/// A single-subscription source buffers events pushed before its listener
/// arrives and panics on a second `subscribe`. A broadcast source accepts
/// any number of concurrent subscribers, drops events while it has none,
/// and ignores pause entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    SingleSubscription,
    Broadcast,
}

/// A handle to a sequence of events.
///
/// Handles are cheap to clone; all clones refer to the same underlying
/// source. Events are `Result<T, EventError>` and the end of the sequence
/// is the stream's end. Sources are produced by a
/// [`SourceController`][crate::SourceController], by the interop
/// constructors here, or by transforming another source.
pub struct EventSource<T> {
    shared: SharedRef<T>,
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        EventSource {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> EventSource<T> {
    pub(crate) fn from_shared(shared: SharedRef<T>) -> Self {
        EventSource { shared }
    }

    pub(crate) fn shared(&self) -> &SharedRef<T> {
        &self.shared
    }

    /// Scope-driven teardown of a bound source; see
    /// [`Scope::bind_source`][crate::Scope::bind_source].
    pub(crate) fn scope_cancel(&self, signal: Cancelled) {
        self.shared.scope_cancel(signal);
    }

    pub fn kind(&self) -> SourceKind {
        self.shared.kind()
    }

    /// Begins listening.
    ///
    /// Never suspends. Panics if the source is single-subscription and has
    /// already been subscribed once.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with(SubscribeOptions::default())
    }

    /// Begins listening with explicit options.
    pub fn subscribe_with(&self, options: SubscribeOptions) -> Subscription<T> {
        let key = self.shared.subscribe(options.cancel_on_error);
        Subscription::new(Arc::clone(&self.shared), key)
    }

    /// A single-subscription source yielding the items of `iter` and then
    /// ending. The items are buffered until the subscriber arrives.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let controller = crate::SourceController::new();
        for item in iter {
            controller.push(item);
        }
        controller.close();
        controller.source()
    }

    /// A single-subscription source driven by any [`futures::Stream`].
    ///
    /// The stream is polled lazily from the subscriber side; it is not
    /// advanced past the last delivered item.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let shared: SharedRef<T> = Arc::new(Shared::new(
            SourceKind::SingleSubscription,
            Default::default(),
        ));
        shared.attach_pump(Box::new(StreamPump {
            stream: Box::pin(stream),
            destination: Arc::downgrade(&shared),
            finished: false,
        }));
        EventSource { shared }
    }
}

/// Adapter pump feeding a plain `futures::Stream` into a source. Holds
/// its destination weakly; it lives inside that destination's state.
struct StreamPump<T, S> {
    stream: Pin<Box<S>>,
    destination: Weak<Shared<T>>,
    finished: bool,
}

impl<T, S> Pump for StreamPump<T, S>
where
    T: Clone + Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    fn tick(&mut self, cx: &mut Context<'_>) -> PumpTick {
        let destination = match self.destination.upgrade() {
            Some(shared) => shared,
            None => return PumpTick::Done,
        };
        if self.finished || destination.is_closed() {
            return PumpTick::Done;
        }
        match self.stream.as_mut().poll_next(cx) {
            std::task::Poll::Pending => PumpTick::Pending,
            std::task::Poll::Ready(Some(item)) => {
                destination.push_event(Ok(item));
                PumpTick::Progress
            }
            std::task::Poll::Ready(None) => {
                self.finished = true;
                destination.close();
                PumpTick::Done
            }
        }
    }

    fn dest_listened(&mut self) {}

    fn dest_cancelled(&mut self) {
        // The listener went away; stop pulling the stream.
        self.finished = true;
    }

    fn dest_paused(&mut self) {}

    fn dest_resumed(&mut self) {}
}
