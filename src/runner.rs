//! The public API: `BatchRunner::start`, `buffer`, `metrics`, `shutdown`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Message};
use crate::error::{ConfigError, RunnerError};
use crate::handler::Handler;
use crate::metrics::Metrics;
use crate::streamer::Streamer;

/// A handle to a running Buffered Batch Task Runner.
///
/// Cheaply [`Clone`]: every clone shares the same Dispatcher mailbox, so
/// many producers can submit items concurrently (§4.1/§5 of
/// `SPEC_FULL.md`).
pub struct BatchRunner<Item> {
    mailbox_tx: mpsc::Sender<Message<Item>>,
    default_shutdown_deadline: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl<Item> Clone for BatchRunner<Item> {
    fn clone(&self) -> Self {
        Self {
            mailbox_tx: self.mailbox_tx.clone(),
            default_shutdown_deadline: self.default_shutdown_deadline,
            shutting_down: self.shutting_down.clone(),
        }
    }
}

impl<Item: Send + 'static> BatchRunner<Item> {
    /// Construct and start a Buffered Batch Task Runner.
    ///
    /// Validates `config`, spawns the Dispatcher task on
    /// `config`'s `runtime`, and kicks off the Initial Streamer.
    ///
    /// Requires `Item: Clone`: the Handler Task Pool retains a copy of
    /// each in-flight batch so a crashed invocation can be requeued
    /// without changing `Handler::run`'s signature to borrow its batch.
    pub fn start<H, St, S>(handler: H, streamer: St, config: Config<S>) -> Result<Self, ConfigError>
    where
        H: Handler<S, Item = Item>,
        H::Item: Clone,
        St: Streamer<S, Item = Item>,
        S: Send + Sync + 'static,
    {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity);
        let runtime = config.runtime.clone();
        let default_shutdown_deadline = config.shutdown_deadline;

        let dispatcher = Dispatcher::new(Arc::new(handler), Arc::new(streamer), config, mailbox_tx.clone());
        runtime.spawn(dispatcher.run(mailbox_rx));

        let startup_tx = mailbox_tx.clone();
        runtime.spawn(async move {
            let _ = startup_tx.send(Message::InitialStream).await;
        });

        Ok(Self {
            mailbox_tx,
            default_shutdown_deadline,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Append `items` to the Staging Buffer. Returns once the Dispatcher
    /// has acknowledged receipt, or `RunnerError::Timeout` if `timeout`
    /// elapses first. A timeout does not corrupt Dispatcher state — the
    /// message may still be delivered and processed afterward.
    pub async fn buffer(&self, items: Vec<Item>, timeout: Duration) -> Result<(), RunnerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        let send_and_wait = async {
            self.mailbox_tx
                .send(Message::Buffer(items, ack_tx))
                .await
                .map_err(|_| RunnerError::Gone)?;
            ack_rx.await.map_err(|_| RunnerError::Gone)
        };

        match tokio::time::timeout(timeout, send_and_wait).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout),
        }
    }

    /// The `shutdown_deadline` this runner was configured with, for
    /// callers that want to `shutdown(runner.default_shutdown_deadline())`
    /// rather than picking their own deadline at the call site.
    pub fn default_shutdown_deadline(&self) -> Duration {
        self.default_shutdown_deadline
    }

    /// Return the current `{buffer_gauge, task_gauge}` snapshot.
    pub async fn metrics(&self) -> Result<Metrics, RunnerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox_tx
            .send(Message::Metrics(reply_tx))
            .await
            .map_err(|_| RunnerError::Gone)?;
        reply_rx.await.map_err(|_| RunnerError::Gone)
    }

    /// Stop timers, cancel the Initial Streamer, wait for in-flight
    /// handlers up to `deadline`, then terminate the Dispatcher task.
    ///
    /// Consumes this handle; other clones become inert once the
    /// Dispatcher exits (their calls will resolve to `RunnerError::Gone`).
    pub async fn shutdown(self, deadline: Duration) -> Result<(), RunnerError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        let send_result = tokio::time::timeout(
            deadline + Duration::from_millis(50),
            async {
                self.mailbox_tx
                    .send(Message::Shutdown(deadline, reply_tx))
                    .await
                    .map_err(|_| RunnerError::Gone)?;
                reply_rx.await.map_err(|_| RunnerError::Gone)
            },
        )
        .await;

        match send_result {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout),
        }
    }
}
