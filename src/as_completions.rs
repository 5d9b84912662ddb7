//! Per-event completions: error handling inside the loop.
//!
//! `as_completions` turns a source of values into a source of
//! already-settled [`Completion`]s, one per event. A consumer can then
//! await each element and handle its error locally, instead of having an
//! error event tear through the surrounding iteration.

use crate::completion::Completion;
use crate::error::EventError;
use crate::source::EventSource;
use crate::transformer::{LifecycleTransformer, TransformerContext};

struct CompletionsTransformer;

impl<T: Clone + Send + 'static> LifecycleTransformer<T, Completion<T>> for CompletionsTransformer {
    fn on_source_item(&mut self, cx: &mut TransformerContext<'_, T, Completion<T>>, item: T) {
        cx.destination.push(Completion::resolved(item));
    }

    fn on_source_error(
        &mut self,
        cx: &mut TransformerContext<'_, T, Completion<T>>,
        error: EventError,
    ) {
        // Errors become data: a settled, failed completion. The
        // destination's own error channel stays silent.
        cx.destination.push(Completion::faulted(error));
    }
}

impl<T: Clone + Send + 'static> EventSource<T> {
    /// A source of one settled [`Completion`] per event of this source.
    ///
    /// Data events resolve, error events fail, and the done signal closes
    /// the output. The subscription contract is preserved: transforming a
    /// single-subscription source yields a single-subscription output.
    pub fn as_completions(&self) -> EventSource<Completion<T>> {
        self.transform(CompletionsTransformer)
    }
}
