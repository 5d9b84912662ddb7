//! One-shot completions.
//!
//! A [`Completer`]/[`Completion`] pair is the crate's promise primitive:
//! the completer settles exactly once, the completion is a future that
//! observes the settled result. Settling publishes the terminal state
//! under the state mutex before `complete`/`fail` return, so an observer
//! on the settling stack already sees it; there is no scheduled
//! callback in between.
//!
//! [`Completion::resolved`] and [`Completion::faulted`] construct
//! already-settled completions; the per-event adapter
//! ([`EventSource::as_completions`][crate::EventSource::as_completions])
//! emits those.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::EventError;

enum State<T> {
    Pending(Option<Waker>),
    Settled(Result<T, EventError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// Creates a linked completer/completion pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending(None)),
    });
    (
        Completer {
            inner: Some(Arc::clone(&inner)),
        },
        Completion { inner },
    )
}

/// The settling half of a completion pair.
///
/// Consumed by [`complete`][Completer::complete] or
/// [`fail`][Completer::fail]. Dropping a completer that never settled
/// fails the completion with [`CompleterDropped`].
pub struct Completer<T> {
    inner: Option<Arc<Inner<T>>>,
}

/// Error observed by a completion whose completer was dropped unsettled.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("completer dropped without settling")]
pub struct CompleterDropped;

impl<T> Completer<T> {
    /// Settles with a value.
    pub fn complete(mut self, value: T) {
        self.settle(Ok(value));
    }

    /// Settles with an error.
    pub fn fail(mut self, error: EventError) {
        self.settle(Err(error));
    }

    fn settle(&mut self, result: Result<T, EventError>) {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return,
        };
        let waker = {
            let mut state = inner.state.lock().unwrap();
            match &mut *state {
                State::Pending(waker) => {
                    let waker = waker.take();
                    *state = State::Settled(result);
                    waker
                }
                State::Settled(_) => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.settle(Err(EventError::failed(CompleterDropped)));
        }
    }
}

/// A future observing the result of a one-shot computation.
///
/// Clones observe the same settled state; results are cloned out, so any
/// number of awaiters may share one completion.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Completion<T> {
    /// An already-settled successful completion.
    pub fn resolved(value: T) -> Self {
        Completion {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Settled(Ok(value))),
            }),
        }
    }

    /// An already-settled failed completion.
    pub fn faulted(error: EventError) -> Self {
        Completion {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Settled(Err(error))),
            }),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Settled(_))
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Result<T, EventError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Settled(result) => Poll::Ready(result.clone()),
            State::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}
