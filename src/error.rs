//! Error types for the batch runner.

use thiserror::Error;

/// Misconfiguration detected while building a [`crate::Config`].
///
/// Fatal to construction; a `BatchRunner` is never started with an invalid
/// configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("missing required option: {field}")]
    Missing { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Operation-level errors surfaced to callers of the public API.
///
/// Handler transient failures and crashes are *not* represented here —
/// they are absorbed by the Dispatcher as requeues and never reach a
/// caller as a `Result::Err`.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    #[error("timed out waiting for the dispatcher to acknowledge the request")]
    Timeout,

    #[error("the batch runner is shutting down and no longer accepts this operation")]
    ShuttingDown,

    #[error("the batch runner's dispatcher task has already exited")]
    Gone,
}
