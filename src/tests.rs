//! End-to-end scenarios across scopes, bound work and transformers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures::{Stream, StreamExt};

use crate::completion::completion;
use crate::error::{Cancelled, EventError};
use crate::test_util::{drain_now, noop_context};
use crate::{merge2, EventSource, Scope};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A value that settled just before the cancel pass still loses: the
/// awaiters resume into the cancellation signal, never into the value,
/// and never while the scope reads as not-yet-cancelled.
#[test]
fn race_lost_by_value() {
    init_logging();
    let scope = Scope::new();
    let (c1, f1) = completion::<i32>();
    let (c2, f2) = completion::<i32>();
    let (c3, f3) = completion::<i32>();

    let mut b1 = Box::pin(scope.bind_future(f1));
    let mut b2 = Box::pin(scope.bind_future(f2));
    let mut cx = noop_context();
    assert!(b1.as_mut().poll(&mut cx).is_pending());
    assert!(b2.as_mut().poll(&mut cx).is_pending());

    // c1's value is in flight when the scope cancels; c2 settles after.
    c1.complete(1);
    scope.cancel_all();
    c2.complete(2);

    assert!(scope.is_cancelled());
    match b1.as_mut().poll(&mut cx) {
        Poll::Ready(Err(signal)) => {
            assert_eq!(signal.scope(), scope.id());
            assert!(scope.is_cancelled());
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    match b2.as_mut().poll(&mut cx) {
        Poll::Ready(Err(signal)) => assert_eq!(signal.scope(), scope.id()),
        other => panic!("expected cancellation, got {:?}", other),
    }

    // An unbound completion is untouched by any of this.
    c3.complete(3);
    assert_eq!(futures::executor::block_on(f3), Ok(3));
}

/// Nothing lexically after the await of a cancelled bound future runs.
#[test]
fn no_continuation_after_cancelled_await() {
    let scope = Scope::new();
    let bound = scope.bind_future(futures::future::pending::<i32>());
    scope.cancel_all();

    let resumed = Arc::new(AtomicBool::new(false));
    let resumed_inner = Arc::clone(&resumed);
    let block = async move {
        let value = bound.await?;
        resumed_inner.store(true, Ordering::SeqCst);
        Ok(value)
    };
    let outcome = futures::executor::block_on(scope.catch_cancellations::<i32, Cancelled, _>(block));
    assert_eq!(outcome, Ok(None));
    assert!(!resumed.load(Ordering::SeqCst));
}

/// Consume two events of a bound stream, cancel, and observe exactly one
/// cancellation error followed by the end of the stream.
#[async_std::test]
async fn stream_cancel() {
    init_logging();
    let scope = Scope::new();
    let bound = scope.bind_source(&EventSource::from_iter(vec![1, 2, 3, 4]));
    let mut sub = bound.subscribe();

    assert_eq!(sub.next().await, Some(Ok(1)));
    assert_eq!(sub.next().await, Some(Ok(2)));

    scope.cancel_all();

    match sub.next().await {
        Some(Err(EventError::Cancelled(signal))) => assert_eq!(signal.scope(), scope.id()),
        other => panic!("expected cancellation event, got {:?}", other),
    }
    assert_eq!(sub.next().await, None);
}

/// Latest-value merge of two typed streams, interleaved
/// A1, B21, A2, B22, A3, B23.
#[test]
fn merge_two_streams() {
    let a = crate::SourceController::new();
    let b = crate::SourceController::new();
    let merged = merge2(&a.source(), &b.source());
    let sub = merged.subscribe();

    a.push(1);
    b.push(21);
    a.push(2);
    b.push(22);
    a.push(3);
    b.push(23);
    a.close();
    b.close();

    assert_eq!(
        drain_now(sub),
        vec![
            Ok((1, 21)),
            Ok((2, 21)),
            Ok((2, 22)),
            Ok((3, 22)),
            Ok((3, 23)),
        ]
    );
}

/// Per-event completions isolate a mid-stream error: the loop survives
/// it and the output still closes.
#[async_std::test]
async fn per_event_error_isolation() {
    let controller = crate::SourceController::new();
    let source = controller.source();
    controller.push(1);
    controller.push_error(EventError::failed(crate::test_util::Boom));
    controller.push(2);
    controller.close();

    let mut sub = source.as_completions().subscribe();
    let mut seen = Vec::new();
    while let Some(event) = sub.next().await {
        let completion = event.expect("adapter emits completions, not error events");
        match completion.await {
            Ok(value) => seen.push(Some(value)),
            Err(_) => seen.push(None),
        }
    }
    assert_eq!(seen, vec![Some(1), None, Some(2)]);
}

/// An early-invoked cancel listener runs once, and cancellation does not
/// run it again.
#[test]
fn cancel_listener_early() {
    let scope = Scope::new();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let listener = scope.add_cancel_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    listener.invoke_early();
    scope.cancel_all();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// A scope's filter absorbs only its own signals; the catch-all absorbs
/// anything.
#[async_std::test]
async fn filter_scoping() {
    let own = Scope::new();

    fn cancelled_elsewhere() -> impl Future<Output = Result<(), Cancelled>> {
        let foreign = Scope::new();
        let bound = foreign.bind_future(futures::future::pending::<()>());
        foreign.cancel_all();
        bound
    }

    let outcome = own.catch_cancellations(cancelled_elsewhere()).await;
    assert!(matches!(outcome, Err(signal) if signal.scope() != own.id()));

    let outcome = Scope::catch_all_cancellations(cancelled_elsewhere()).await;
    assert_eq!(outcome, Ok(None));
}

/// Pause on a bound stream buffers without losing the scope's teardown
/// semantics.
#[test]
fn pause_then_cancel_still_ends_with_one_signal() {
    let scope = Scope::new();
    let controller = crate::SourceController::new();
    let bound = scope.bind_source(&controller.source());
    let mut sub = bound.subscribe();
    let mut cx = noop_context();

    controller.push(1);
    assert_eq!(
        Pin::new(&mut sub).poll_next(&mut cx),
        Poll::Ready(Some(Ok(1)))
    );

    sub.pause();
    controller.push(2);
    assert!(Pin::new(&mut sub).poll_next(&mut cx).is_pending());

    scope.cancel_all();
    sub.resume();

    // The `2` never surfaces; the cancel pass discarded the pipeline's
    // buffers.
    match Pin::new(&mut sub).poll_next(&mut cx) {
        Poll::Ready(Some(Err(EventError::Cancelled(signal)))) => {
            assert_eq!(signal.scope(), scope.id());
        }
        other => panic!("expected cancellation event, got {:?}", other),
    }
    assert_eq!(Pin::new(&mut sub).poll_next(&mut cx), Poll::Ready(None));
}

/// The whole pipeline composes: a merged source bound to a scope is cut
/// by one cancel_all.
#[async_std::test]
async fn merged_source_bound_to_scope() {
    init_logging();
    let scope = Scope::new();
    let a = crate::SourceController::new();
    let b = crate::SourceController::new();
    let bound = scope.bind_source(&merge2(&a.source(), &b.source()));
    let mut sub = bound.subscribe();

    a.push(1);
    b.push(2);
    assert_eq!(sub.next().await, Some(Ok((1, 2))));

    scope.cancel_all();
    match sub.next().await {
        Some(Err(EventError::Cancelled(signal))) => assert_eq!(signal.scope(), scope.id()),
        other => panic!("expected cancellation event, got {:?}", other),
    }
    assert_eq!(sub.next().await, None);
}
