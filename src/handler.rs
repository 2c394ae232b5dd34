//! The `Handler` capability: per-batch work invoked by the Dispatcher.

use async_trait::async_trait;

/// Outcome of one handler invocation, reported back to the Dispatcher.
///
/// See `SPEC_FULL.md` §4.1 for the effect each variant has on the
/// `(batch, retries)` record.
#[derive(Debug)]
pub enum Outcome<Item> {
    /// The batch was handled successfully; discard it.
    Ok,
    /// Retry the same batch, with `retries` incremented.
    Retry,
    /// Retry with a handler-supplied replacement batch, with `retries`
    /// incremented.
    RetryWith(Vec<Item>),
}

/// User-supplied per-batch work function.
///
/// A panic inside `run` is treated identically to returning [`Outcome::Retry`]
/// with the original batch — see the Handler Task Pool design in
/// `SPEC_FULL.md` §4.4.
///
/// `BatchRunner::start` additionally requires `Item: Clone`: the Handler
/// Task Pool keeps a copy of every in-flight batch so it can be requeued
/// if the invocation crashes, alongside the owned batch handed to `run`.
#[async_trait]
pub trait Handler<S>: Send + Sync + 'static {
    /// The opaque item type this handler operates on. `BatchRunner::start`
    /// further requires `Item: Clone` (see the trait-level docs).
    type Item: Send + 'static;

    /// Handle one batch. `retries` is the number of prior attempts on this
    /// exact batch (0 on the first attempt), unbounded and never enforced
    /// by the core.
    async fn run(&self, batch: Vec<Self::Item>, retries: u32, state: &S) -> Outcome<Self::Item>;
}
