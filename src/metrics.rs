//! The two gauges exposed by `metrics()`, and the required telemetry events.

/// Snapshot returned by [`crate::BatchRunner::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metrics {
    /// `|StagingBuffer_items| + |BatchQueue| × max_batch_size`.
    pub buffer_gauge: usize,
    /// `|HandlerTaskPool|`.
    pub task_gauge: usize,
}

/// Emit the `staging-buffer.grow` event required by `SPEC_FULL.md` §6.
///
/// `measurement` is the count of items added; `handler` is the runner's
/// configured `name`, used as the event's dimension.
pub(crate) fn record_staging_buffer_grow(measurement: usize, handler: &str) {
    tracing::event!(
        target: "staging-buffer.grow",
        tracing::Level::DEBUG,
        measurement,
        handler,
    );
}

/// Emit the `staging-buffer.reset` event required by `SPEC_FULL.md` §6.
///
/// Always fires with `measurement = 0`, per the spec.
pub(crate) fn record_staging_buffer_reset(handler: &str) {
    tracing::event!(
        target: "staging-buffer.reset",
        tracing::Level::DEBUG,
        measurement = 0,
        handler,
    );
}
