//! Subscriptions: the consume side of an event pipeline.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::FusedStream;
use futures::Stream;

use crate::error::EventError;
use crate::state::SharedRef;

/// Options for [`EventSource::subscribe_with`][crate::EventSource::subscribe_with].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Tear the subscription down after delivering its first error event.
    ///
    /// Off by default; the subscription then keeps delivering events after
    /// an error, faithfully to the source.
    pub cancel_on_error: bool,
}

/// An active subscription to an [`EventSource`][crate::EventSource].
///
/// Implements [`futures::Stream`] with items of `Result<T, EventError>`;
/// the end of the stream is the source's done signal. Dropping an
/// unfinished subscription cancels it.
pub struct Subscription<T> {
    shared: SharedRef<T>,
    key: usize,
    finished: bool,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub(crate) fn new(shared: SharedRef<T>, key: usize) -> Self {
        Subscription {
            shared,
            key,
            finished: false,
        }
    }

    /// Requests that the source stop producing events for a while.
    ///
    /// Pause nests: every `pause` must be matched by a
    /// [`resume`][Self::resume] before delivery continues. Events arriving
    /// in the meantime are buffered. Subscriptions to broadcast sources
    /// ignore pause.
    pub fn pause(&self) {
        if !self.finished {
            self.shared.pause_slot(self.key);
        }
    }

    /// Undoes one [`pause`][Self::pause].
    pub fn resume(&self) {
        if !self.finished {
            self.shared.resume_slot(self.key);
        }
    }

    /// Stops listening. Buffered undelivered events are discarded.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        if !self.finished {
            self.finished = true;
            self.shared.cancel_slot(self.key);
        }
    }
}

impl<T: Clone + Send + 'static> Stream for Subscription<T> {
    type Item = Result<T, EventError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let poll = this.shared.poll_slot(this.key, cx);
        if let Poll::Ready(None) = poll {
            this.finished = true;
        }
        poll
    }
}

impl<T: Clone + Send + 'static> FusedStream for Subscription<T> {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.shared.cancel_slot(self.key);
        }
    }
}
