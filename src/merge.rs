//! Latest-value merging of several sources into one destination.
//!
//! [`merge_sources`] takes N sources in a fixed order and yields a source
//! of N-element snapshots: every time any input produces a value, the
//! destination emits the latest value of every input, in declared order,
//! starting only once each input has produced at least once. The typed
//! [`merge2`]..[`merge10`] wrappers are sugar over the same combiner.
//!
//! One shared destination controller serves all inputs; each input gets
//! its own transformer section that routes into it, so listen, cancel,
//! pause and resume on the destination fan out to every input
//! subscription.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::controller::SourceController;
use crate::error::EventError;
use crate::source::EventSource;
use crate::transformer::{LifecycleTransformer, MapTransformer, TransformerContext};

const EMPTY_MERGE: &str = "merge_sources requires at least one source";
const SEEDED: &str = "invariant: snapshots only form once every input has emitted";
const SNAPSHOT_ARITY: &str = "invariant: merge snapshots carry one value per declared source";
const SNAPSHOT_TYPE: &str = "invariant: merge snapshots preserve the declared source types";
const BIND_ONCE: &str = "invariant: bind_destination runs once per merge input";

struct MergeState<T> {
    latest: Vec<Option<T>>,
    unseeded: usize,
    active: usize,
}

impl<T: Clone> MergeState<T> {
    fn new(len: usize) -> Self {
        MergeState {
            latest: vec![None; len],
            unseeded: len,
            active: len,
        }
    }

    /// Records a value; returns the snapshot to emit once all inputs have
    /// been seen at least once.
    fn update(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        if self.latest[index].is_none() {
            self.unseeded -= 1;
        }
        self.latest[index] = Some(value);
        if self.unseeded == 0 {
            Some(
                self.latest
                    .iter()
                    .map(|slot| slot.clone().expect(SEEDED))
                    .collect(),
            )
        } else {
            None
        }
    }

    /// Retires a finished input; true when it was the last one.
    fn retire(&mut self) -> bool {
        self.active -= 1;
        self.active == 0
    }
}

/// One input's section of the combiner: a lifecycle transformer that
/// routes into the shared destination instead of creating its own.
///
/// The controller handle is given away at bind time; holding on to it
/// would keep the destination alive from inside its own pump set.
struct MergeSection<T> {
    index: usize,
    state: Arc<Mutex<MergeState<T>>>,
    destination: Option<SourceController<Vec<T>>>,
}

impl<T: Clone + Send + 'static> LifecycleTransformer<T, Vec<T>> for MergeSection<T> {
    fn bind_destination(&mut self, _source: &EventSource<T>) -> SourceController<Vec<T>> {
        self.destination.take().expect(BIND_ONCE)
    }

    fn on_source_item(&mut self, cx: &mut TransformerContext<'_, T, Vec<T>>, item: T) {
        let snapshot = self.state.lock().unwrap().update(self.index, item);
        if let Some(snapshot) = snapshot {
            cx.destination.push(snapshot);
        }
    }

    fn on_source_error(&mut self, cx: &mut TransformerContext<'_, T, Vec<T>>, error: EventError) {
        // Wrapped with its origin; the merged stream does not stop.
        cx.destination.push_error(EventError::MergeInput {
            index: self.index,
            source: Box::new(error),
        });
    }

    fn on_source_done(&mut self, cx: &mut TransformerContext<'_, T, Vec<T>>) {
        let last = self.state.lock().unwrap().retire();
        if last && !cx.destination.is_closed() {
            tracing::trace!("merge destination closing: all inputs done");
            cx.destination.close();
        }
    }
}

/// Merges `sources` into a single source of latest-value snapshots.
///
/// The first snapshot is emitted once every input has produced at least
/// one value; after that, each input value emits a fresh snapshot. Input
/// errors are wrapped as [`EventError::MergeInput`] with the input's
/// position and do not end the merged stream. The destination closes when
/// the last input finishes, whether or not a snapshot was ever emitted.
///
/// Panics if `sources` is empty.
pub fn merge_sources<T>(sources: Vec<EventSource<T>>) -> EventSource<Vec<T>>
where
    T: Clone + Send + 'static,
{
    assert!(!sources.is_empty(), "{}", EMPTY_MERGE);
    let destination = SourceController::new();
    let state = Arc::new(Mutex::new(MergeState::new(sources.len())));
    let output = destination.source();
    for (index, source) in sources.iter().enumerate() {
        source.transform(MergeSection {
            index,
            state: Arc::clone(&state),
            destination: Some(destination.clone()),
        });
    }
    output
}

type Erased = Arc<dyn Any + Send + Sync>;

fn erase<T>(source: &EventSource<T>) -> EventSource<Erased>
where
    T: Clone + Send + Sync + 'static,
{
    source.transform(MapTransformer::new(|item: T| Arc::new(item) as Erased))
}

fn reify<T>(value: Erased) -> T
where
    T: Clone + Send + Sync + 'static,
{
    match value.downcast::<T>() {
        Ok(value) => (*value).clone(),
        Err(_) => panic!("{}", SNAPSHOT_TYPE),
    }
}

macro_rules! typed_merge {
    ($(#[$attr:meta])* $name:ident => $($param:ident : $ty:ident),+) => {
        $(#[$attr])*
        pub fn $name<$($ty),+>($($param: &EventSource<$ty>),+) -> EventSource<($($ty,)+)>
        where
            $($ty: Clone + Send + Sync + 'static,)+
        {
            let merged = merge_sources(vec![$(erase($param)),+]);
            merged.transform(MapTransformer::new(|snapshot: Vec<Erased>| {
                let mut values = snapshot.into_iter();
                ($(reify::<$ty>(values.next().expect(SNAPSHOT_ARITY)),)+)
            }))
        }
    };
}

typed_merge! {
    /// Two-source typed merge; see [`merge_sources`].
    merge2 => a: A, b: B
}
typed_merge! {
    /// Three-source typed merge; see [`merge_sources`].
    merge3 => a: A, b: B, c: C
}
typed_merge! {
    /// Four-source typed merge; see [`merge_sources`].
    merge4 => a: A, b: B, c: C, d: D
}
typed_merge! {
    /// Five-source typed merge; see [`merge_sources`].
    merge5 => a: A, b: B, c: C, d: D, e: E
}
typed_merge! {
    /// Six-source typed merge; see [`merge_sources`].
    merge6 => a: A, b: B, c: C, d: D, e: E, f: F
}
typed_merge! {
    /// Seven-source typed merge; see [`merge_sources`].
    merge7 => a: A, b: B, c: C, d: D, e: E, f: F, g: G
}
typed_merge! {
    /// Eight-source typed merge; see [`merge_sources`].
    merge8 => a: A, b: B, c: C, d: D, e: E, f: F, g: G, h: H
}
typed_merge! {
    /// Nine-source typed merge; see [`merge_sources`].
    merge9 => a: A, b: B, c: C, d: D, e: E, f: F, g: G, h: H, i: I
}
typed_merge! {
    /// Ten-source typed merge; see [`merge_sources`].
    merge10 => a: A, b: B, c: C, d: D, e: E, f: F, g: G, h: H, i: I, j: J
}
