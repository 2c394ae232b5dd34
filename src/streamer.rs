//! The `Streamer` capability: one-shot enumeration of pre-existing items.

use std::sync::Arc;

use futures::stream::BoxStream;

/// User-supplied one-shot enumeration of pending items from an external
/// source (e.g. a slow paginated scan of a data store).
///
/// The Initial Streamer task (see `SPEC_FULL.md` §4.3) drives the returned
/// stream to completion exactly once per `BatchRunner` lifetime, folding
/// arriving items into fixed-size groups and handing each off to the
/// Dispatcher as it fills.
pub trait Streamer<S>: Send + Sync + 'static {
    /// The opaque item type this streamer enumerates. Must match the
    /// paired `Handler::Item`.
    type Item: Send + 'static;

    /// Produce the stream of pending items. Invoked once; the stream
    /// ending signals that enumeration is complete.
    fn stream(&self, state: Arc<S>) -> BoxStream<'static, Self::Item>;
}
