//! Construction configuration for a [`crate::BatchRunner`].

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::error::ConfigError;

const DEFAULT_MAILBOX_CAPACITY: usize = 1024;
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Construction configuration for a [`crate::BatchRunner`].
///
/// Built via [`ConfigBuilder`]; construct with `Config::builder()`.
pub struct Config<S> {
    pub(crate) flush_interval: Duration,
    pub(crate) max_concurrency: usize,
    pub(crate) max_batch_size: usize,
    pub(crate) init_chunk_size: usize,
    pub(crate) handler_state: Arc<S>,
    pub(crate) mailbox_capacity: usize,
    pub(crate) shutdown_deadline: Duration,
    pub(crate) runtime: Handle,
    pub(crate) name: Option<String>,
}

impl<S> Config<S> {
    /// Start building a configuration.
    pub fn builder() -> ConfigBuilder<S> {
        ConfigBuilder::new()
    }

    /// The registration name, if any, used for logs/metrics/addressing.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Builder for configuring a [`Config`].
///
/// Mirrors the fluent-builder style used elsewhere in this crate
/// (`ClientBuilder`, `ProducerBuilder`): every setter takes `self` by value
/// and returns `Self`, and `build()` is the single fallible step.
#[must_use = "builders do nothing unless you call .build()"]
pub struct ConfigBuilder<S> {
    flush_interval: Option<Duration>,
    max_concurrency: Option<usize>,
    max_batch_size: Option<usize>,
    init_chunk_size: Option<usize>,
    handler_state: Option<Arc<S>>,
    mailbox_capacity: usize,
    shutdown_deadline: Duration,
    runtime: Option<Handle>,
    name: Option<String>,
}

impl<S> ConfigBuilder<S> {
    pub fn new() -> Self {
        Self {
            flush_interval: None,
            max_concurrency: None,
            max_batch_size: None,
            init_chunk_size: None,
            handler_state: None,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            runtime: None,
            name: None,
        }
    }

    /// Interval between Staging Buffer drains.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Upper bound on simultaneous handler invocations.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Maximum items per batch delivered to the handler.
    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.max_batch_size = Some(n);
        self
    }

    /// Initial Streamer delivery granularity.
    pub fn init_chunk_size(mut self, n: usize) -> Self {
        self.init_chunk_size = Some(n);
        self
    }

    /// Opaque state passed to every handler invocation and to the streamer.
    pub fn handler_state(mut self, state: impl Into<Arc<S>>) -> Self {
        self.handler_state = Some(state.into());
        self
    }

    /// Bound on the Dispatcher's inbound mailbox (transport-level, see
    /// `SPEC_FULL.md` §5). Defaults to 1024.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Default deadline used by `shutdown()` if the caller doesn't override
    /// it. Defaults to 30s.
    pub fn shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// The concurrent-task factory used to spawn the Dispatcher, streamer,
    /// and handler tasks. Defaults to `Handle::current()` at `build()` time.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Registration name, used for logs/metrics/addressing.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate and build the configuration.
    ///
    /// Fails with a [`ConfigError`] naming the first missing or invalid
    /// field encountered.
    pub fn build(self) -> Result<Config<S>, ConfigError> {
        let flush_interval = self.flush_interval.ok_or(ConfigError::Missing {
            field: "flush_interval",
        })?;
        let max_concurrency = self.max_concurrency.ok_or(ConfigError::Missing {
            field: "max_concurrency",
        })?;
        if max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrency",
                reason: "must be greater than zero".to_string(),
            });
        }
        let max_batch_size = self.max_batch_size.ok_or(ConfigError::Missing {
            field: "max_batch_size",
        })?;
        if max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        let init_chunk_size = self.init_chunk_size.ok_or(ConfigError::Missing {
            field: "init_chunk_size",
        })?;
        if init_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "init_chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        let handler_state = self.handler_state.ok_or(ConfigError::Missing {
            field: "handler_state",
        })?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ConfigError::Invalid {
                field: "runtime",
                reason: "no ambient tokio runtime; pass one explicitly via .runtime(..)"
                    .to_string(),
            })?,
        };

        Ok(Config {
            flush_interval,
            max_concurrency,
            max_batch_size,
            init_chunk_size,
            handler_state,
            mailbox_capacity: self.mailbox_capacity,
            shutdown_deadline: self.shutdown_deadline,
            runtime,
            name: self.name,
        })
    }
}

impl<S> Default for ConfigBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
