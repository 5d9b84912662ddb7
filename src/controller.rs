//! Controllers: the push side of an event pipeline.

use std::sync::Arc;

use crate::error::EventError;
use crate::source::{EventSource, SourceKind};
use crate::state::{LifecycleHooks, Shared, SharedRef};

/// The push side of an [`EventSource`].
///
/// A controller is created first; [`source()`][SourceController::source]
/// then hands out the listen side. Lifecycle callbacks (listen, cancel,
/// pause, resume) are installed through the [builder][SourceController::builder]
/// and run synchronously on the stack that triggered the transition.
///
/// ```
/// use streamscope::SourceController;
///
/// let controller = SourceController::builder()
///     .on_listen(|| println!("someone is listening"))
///     .build();
/// let source = controller.source();
/// controller.push(1u32);
/// controller.close();
/// # let _ = source;
/// ```
pub struct SourceController<T> {
    shared: SharedRef<T>,
}

impl<T> Clone for SourceController<T> {
    fn clone(&self) -> Self {
        SourceController {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> SourceController<T> {
    pub(crate) fn from_shared(shared: SharedRef<T>) -> Self {
        SourceController { shared }
    }

    /// A single-subscription controller with no lifecycle callbacks.
    pub fn new() -> Self {
        SourceController::builder().build()
    }

    /// A broadcast controller with no lifecycle callbacks.
    pub fn broadcast() -> Self {
        SourceController::builder().broadcast().build()
    }

    pub fn builder() -> SourceControllerBuilder<T> {
        SourceControllerBuilder {
            kind: SourceKind::SingleSubscription,
            hooks: LifecycleHooks::default(),
            _marker: std::marker::PhantomData,
        }
    }

    /// The listen side of this controller.
    pub fn source(&self) -> EventSource<T> {
        EventSource::from_shared(Arc::clone(&self.shared))
    }

    /// Delivers a data event. Panics if the controller is closed.
    pub fn push(&self, item: T) {
        self.shared.push_event(Ok(item));
    }

    /// Delivers an error event. The source stays open; whether listeners
    /// keep receiving events afterwards is their
    /// [`cancel_on_error`][crate::SubscribeOptions::cancel_on_error] choice.
    /// Panics if the controller is closed.
    pub fn push_error(&self, error: EventError) {
        self.shared.push_event(Err(error));
    }

    /// Ends the sequence. Buffered events still drain to subscribers,
    /// followed by end-of-stream. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn has_listener(&self) -> bool {
        self.shared.has_listener()
    }
}

impl<T: Clone + Send + 'static> Default for SourceController<T> {
    fn default() -> Self {
        SourceController::new()
    }
}

/// Builder for [`SourceController`].
pub struct SourceControllerBuilder<T> {
    kind: SourceKind,
    hooks: LifecycleHooks,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + 'static> SourceControllerBuilder<T> {
    /// Makes the controller broadcast: any number of subscribers, no
    /// pre-listen buffering, pause ignored.
    pub fn broadcast(mut self) -> Self {
        self.kind = SourceKind::Broadcast;
        self
    }

    /// Runs when the subscriber count goes from zero to one.
    pub fn on_listen<F: FnMut() + Send + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_listen = Some(Box::new(hook));
        self
    }

    /// Runs when the subscriber count drops back to zero through
    /// cancellation.
    pub fn on_cancel<F: FnMut() + Send + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_cancel = Some(Box::new(hook));
        self
    }

    /// Runs when the subscription enters the paused state.
    pub fn on_pause<F: FnMut() + Send + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_pause = Some(Box::new(hook));
        self
    }

    /// Runs when the subscription leaves the paused state.
    pub fn on_resume<F: FnMut() + Send + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_resume = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> SourceController<T> {
        SourceController {
            shared: Arc::new(Shared::new(self.kind, self.hooks)),
        }
    }
}
