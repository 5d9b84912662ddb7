//! Scope-bound cancellation for async computations and event streams.
//!
//! A [`Scope`] groups asynchronous work, one-shot futures and event
//! sources alike, under a single cancellation cut point. Cancelling the scope
//! is synchronous: the moment [`Scope::cancel_all`] returns, every bound
//! future is guaranteed to reject instead of resuming with a value, and
//! every bound source delivers at most one cancellation error before
//! ending. Scopes nest; cancelling a parent cancels its children, never
//! the other way around.
//!
//! ## Binding work
//!
//! ```
//! use futures::executor::block_on;
//! use streamscope::Scope;
//!
//! let scope = Scope::new();
//! let bound = scope.bind_future(async { 41 + 1 });
//! scope.cancel_all();
//!
//! // The scope cancelled first: the awaiter sees the signal, never 42.
//! let result = block_on(bound);
//! assert_eq!(result.unwrap_err().scope(), scope.id());
//! assert!(scope.is_cancelled());
//! ```
//!
//! Cancellation is *observational*: it guarantees no further effects are
//! observed through the bound handles, not that the underlying producer
//! stops running.
//!
//! ## Event sources
//!
//! The stream side is built from [`SourceController`] /
//! [`EventSource`] / [`Subscription`] (push, listen, consume) with
//! single-subscription and broadcast flavors, pause/resume, and an
//! error channel that preserves original payloads.
//! [`LifecycleTransformer`] derives new sources from existing ones while
//! keeping those semantics intact by default; [`merge_sources`] (and the
//! typed [`merge2`]..[`merge10`]) and
//! [`EventSource::as_completions`] are built on it, as is
//! [`Scope::bind_source`] itself.
//!
//! ## Absorbing cancellation
//!
//! [`Scope::catch_cancellations`] runs a block and absorbs the
//! cancellation signals of that scope, and only that scope, while
//! every other error propagates; see [`AsCancellation`].
//!
//! Everything here is cooperative and lock-light: handles are `Send` and
//! may be shared across threads, while all delivery happens on the
//! consuming task's own stack when it polls.

mod as_completions;
mod bound;
mod completion;
mod controller;
mod error;
mod filter;
mod merge;
mod scope;
mod source;
mod state;
mod subscription;
mod transformer;

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;

pub use bound::BoundFuture;
pub use completion::{completion, Completer, CompleterDropped, Completion};
pub use controller::{SourceController, SourceControllerBuilder};
pub use error::{Cancelled, EventError, ScopeId, SharedError};
pub use filter::AsCancellation;
pub use merge::{
    merge10, merge2, merge3, merge4, merge5, merge6, merge7, merge8, merge9, merge_sources,
};
pub use scope::{CancelListener, Scope};
pub use source::{EventSource, SourceKind};
pub use subscription::{SubscribeOptions, Subscription};
pub use transformer::{
    IdentityTransformer, LifecycleTransformer, MapTransformer, TransformerContext,
};
