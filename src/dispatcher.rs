//! The Dispatcher: the single-owner serial coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::batch::{chunk, BatchQueue, Record};
use crate::config::Config;
use crate::handler::{Handler, Outcome};
use crate::metrics::{record_staging_buffer_grow, record_staging_buffer_reset, Metrics};
use crate::staging::StagingBuffer;
use crate::streamer::Streamer;
use crate::token::{Token, TokenGenerator};

/// Messages accepted by the Dispatcher's single inbound mailbox.
///
/// See `SPEC_FULL.md` §4.1 for the full semantics of each variant.
pub(crate) enum Message<Item> {
    Buffer(Vec<Item>, oneshot::Sender<()>),
    AsyncEnqueue(VecDeque<Record<Item>>),
    Flush,
    InitialStream,
    HandlerDone(Token, Outcome<Item>),
    TaskCrashed(Token, CrashReason),
    Metrics(oneshot::Sender<Metrics>),
    Shutdown(std::time::Duration, oneshot::Sender<()>),
}

/// Why a supervised task ended abnormally (or, for the Initial Streamer,
/// completed normally — reused here rather than a second message type
/// because the Dispatcher's reaction in both cases is "was this the
/// streamer's token?").
#[derive(Debug)]
pub(crate) enum CrashReason {
    /// The Initial Streamer's stream was exhausted without panicking.
    Normal,
    /// The supervised task's `JoinHandle` resolved to an error (panic or
    /// cancellation), carrying the `JoinError`'s `Display` rendering.
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamerState {
    NotStarted,
    Running,
    Complete,
}

pub(crate) struct Dispatcher<H, St, S>
where
    H: Handler<S>,
    St: Streamer<S, Item = H::Item>,
{
    handler: Arc<H>,
    streamer: Arc<St>,
    config: Config<S>,
    mailbox_tx: mpsc::Sender<Message<H::Item>>,
    queue: BatchQueue<H::Item>,
    staging: StagingBuffer<H::Item>,
    pool: HashMap<Token, Record<H::Item>>,
    tokens: TokenGenerator,
    streamer_state: StreamerState,
    streamer_token: Option<Token>,
    flush_timer: Option<JoinHandle<()>>,
    /// The supervisor task awaiting the Initial Streamer and reporting its
    /// outcome back to the Dispatcher.
    streamer_handle: Option<JoinHandle<()>>,
    /// Abort handle for the *inner* task actually running
    /// `run_initial_streamer` — the supervisor only awaits it, so aborting
    /// `streamer_handle` alone would stop listening without stopping the
    /// enumeration itself.
    streamer_abort: Option<AbortHandle>,
}

impl<H, St, S> Dispatcher<H, St, S>
where
    H: Handler<S>,
    H::Item: Clone,
    St: Streamer<S, Item = H::Item>,
    S: Send + Sync + 'static,
{
    pub(crate) fn new(
        handler: Arc<H>,
        streamer: Arc<St>,
        config: Config<S>,
        mailbox_tx: mpsc::Sender<Message<H::Item>>,
    ) -> Self {
        Self {
            handler,
            streamer,
            config,
            mailbox_tx,
            queue: BatchQueue::new(),
            staging: StagingBuffer::new(),
            pool: HashMap::new(),
            tokens: TokenGenerator::new(),
            streamer_state: StreamerState::NotStarted,
            streamer_token: None,
            flush_timer: None,
            streamer_handle: None,
            streamer_abort: None,
        }
    }

    fn handler_label(&self) -> &str {
        self.config.name.as_deref().unwrap_or("unnamed")
    }

    /// The Dispatcher's main loop: one message at a time, forever, until
    /// `Shutdown` is processed or the mailbox closes.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Message<H::Item>>) {
        self.rearm_flush_timer();
        loop {
            match rx.recv().await {
                Some(Message::Buffer(items, ack)) => {
                    self.on_buffer(items);
                    let _ = ack.send(());
                    self.dispatch_attempt();
                }
                Some(Message::AsyncEnqueue(sub_queue)) => {
                    self.queue.extend(sub_queue);
                    self.dispatch_attempt();
                }
                Some(Message::Flush) => {
                    self.on_flush();
                    self.dispatch_attempt();
                    self.rearm_flush_timer();
                }
                Some(Message::InitialStream) => {
                    self.start_streamer();
                }
                Some(Message::HandlerDone(token, outcome)) => {
                    self.on_handler_done(token, outcome);
                    self.dispatch_attempt();
                }
                Some(Message::TaskCrashed(token, reason)) => {
                    self.on_task_crashed(token, reason);
                    self.dispatch_attempt();
                }
                Some(Message::Metrics(reply)) => {
                    let _ = reply.send(self.metrics());
                }
                Some(Message::Shutdown(deadline, reply)) => {
                    self.shutdown(&mut rx, deadline).await;
                    let _ = reply.send(());
                    break;
                }
                None => {
                    tracing::warn!(handler = self.handler_label(), "mailbox closed unexpectedly");
                    break;
                }
            }
        }
    }

    fn on_buffer(&mut self, items: Vec<H::Item>) {
        let grown = items.len();
        self.staging.push(items);
        record_staging_buffer_grow(grown, self.handler_label());
    }

    fn on_flush(&mut self) {
        if self.staging.is_empty() {
            return;
        }
        let flattened = self.staging.drain_flattened();
        record_staging_buffer_reset(self.handler_label());
        for segment in chunk(flattened, self.config.max_batch_size) {
            self.queue.push_back((segment, 0));
        }
    }

    fn dispatch_attempt(&mut self) {
        while self.pool.len() < self.config.max_concurrency {
            let Some((batch, retries)) = self.queue.pop_front() else {
                break;
            };
            let token = self.tokens.next();
            self.pool.insert(token, (batch.clone(), retries));
            self.spawn_handler(token, batch, retries);
        }
    }

    fn spawn_handler(&self, token: Token, batch: Vec<H::Item>, retries: u32) {
        let handler = self.handler.clone();
        let state = self.config.handler_state.clone();
        let tx = self.mailbox_tx.clone();
        self.config.runtime.spawn(async move {
            let result = tokio::spawn(async move { handler.run(batch, retries, state.as_ref()).await })
                .await;
            match result {
                Ok(outcome) => {
                    let _ = tx.send(Message::HandlerDone(token, outcome)).await;
                }
                Err(join_err) => {
                    let _ = tx
                        .send(Message::TaskCrashed(token, CrashReason::Panicked(join_err.to_string())))
                        .await;
                }
            }
        });
    }

    fn on_handler_done(&mut self, token: Token, outcome: Outcome<H::Item>) {
        let Some((batch, retries)) = self.pool.remove(&token) else {
            return;
        };
        match outcome {
            Outcome::Ok => {
                tracing::debug!(retries, "batch handled successfully");
            }
            Outcome::Retry => {
                tracing::debug!(retries, "batch returned for retry");
                self.queue.push_back((batch, retries + 1));
            }
            Outcome::RetryWith(items) => {
                if items.is_empty() {
                    tracing::debug!("retry requested an empty replacement batch; dropping");
                } else {
                    tracing::debug!(retries, "batch returned for retry with replacement items");
                    self.queue.push_back((items, retries + 1));
                }
            }
        }
    }

    fn on_task_crashed(&mut self, token: Token, reason: CrashReason) {
        if self.streamer_token == Some(token) {
            match reason {
                CrashReason::Normal => {
                    self.streamer_state = StreamerState::Complete;
                    tracing::info!(handler = self.handler_label(), "initial streamer complete");
                }
                CrashReason::Panicked(message) => {
                    tracing::error!(
                        handler = self.handler_label(),
                        error = %message,
                        "initial streamer crashed; undelivered items will not be re-enumerated until restart"
                    );
                }
            }
            return;
        }

        if let Some((batch, retries)) = self.pool.remove(&token) {
            tracing::warn!(retries, "handler invocation crashed; requeueing as retry");
            self.queue.push_back((batch, retries + 1));
        }
    }

    fn start_streamer(&mut self) {
        if self.streamer_state != StreamerState::NotStarted {
            return;
        }
        self.streamer_state = StreamerState::Running;
        let token = self.tokens.next();
        self.streamer_token = Some(token);

        let streamer = self.streamer.clone();
        let state = self.config.handler_state.clone();
        let tx = self.mailbox_tx.clone();
        let init_chunk_size = self.config.init_chunk_size;
        let max_batch_size = self.config.max_batch_size;

        // Spawn the actual enumeration loop on its own task first, so its
        // `AbortHandle` can be kept independently of the supervisor below
        // that merely awaits it. Aborting only the supervisor would stop
        // the Dispatcher from listening for completion without stopping
        // the enumeration itself.
        let inner = self.config.runtime.spawn(async move {
            run_initial_streamer(streamer.as_ref(), state, init_chunk_size, max_batch_size, &tx).await;
        });
        self.streamer_abort = Some(inner.abort_handle());

        let tx = self.mailbox_tx.clone();
        let supervisor = self.config.runtime.spawn(async move {
            match inner.await {
                Ok(()) => {
                    let _ = tx.send(Message::TaskCrashed(token, CrashReason::Normal)).await;
                }
                Err(join_err) => {
                    let _ = tx
                        .send(Message::TaskCrashed(token, CrashReason::Panicked(join_err.to_string())))
                        .await;
                }
            }
        });
        self.streamer_handle = Some(supervisor);
    }

    fn metrics(&self) -> Metrics {
        Metrics {
            buffer_gauge: self.staging.item_count() + self.queue.len() * self.config.max_batch_size,
            task_gauge: self.pool.len(),
        }
    }

    fn rearm_flush_timer(&mut self) {
        if let Some(handle) = self.flush_timer.take() {
            handle.abort();
        }
        let tx = self.mailbox_tx.clone();
        let delay = self.config.flush_interval;
        self.flush_timer = Some(self.config.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::Flush).await;
        }));
    }

    /// Stop timers, cancel the Initial Streamer, and wait for in-flight
    /// handler tasks up to `shutdown_deadline`; handlers still running
    /// after the deadline are abandoned (their outcome messages, if they
    /// ever arrive, land on a mailbox nobody is reading anymore).
    async fn shutdown(&mut self, rx: &mut mpsc::Receiver<Message<H::Item>>, deadline: std::time::Duration) {
        if let Some(handle) = self.flush_timer.take() {
            handle.abort();
        }
        if let Some(abort) = self.streamer_abort.take() {
            abort.abort();
        }
        if let Some(handle) = self.streamer_handle.take() {
            handle.abort();
        }

        let deadline = tokio::time::Instant::now() + deadline;
        while !self.pool.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        outstanding = self.pool.len(),
                        "shutdown deadline elapsed; abandoning in-flight handlers"
                    );
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(Message::HandlerDone(token, outcome)) => self.on_handler_done(token, outcome),
                        Some(Message::TaskCrashed(token, reason)) => self.on_task_crashed(token, reason),
                        Some(Message::Buffer(_, ack)) => {
                            // Accepted into the mailbox before shutdown began processing;
                            // ack so the caller isn't left waiting, but the items are dropped.
                            let _ = ack.send(());
                        }
                        Some(Message::Metrics(reply)) => { let _ = reply.send(self.metrics()); }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }
}

async fn run_initial_streamer<S, St>(
    streamer: &St,
    state: Arc<S>,
    init_chunk_size: usize,
    max_batch_size: usize,
    tx: &mpsc::Sender<Message<St::Item>>,
) where
    St: Streamer<S>,
{
    let mut stream = streamer.stream(state);
    let mut pending: Vec<St::Item> = Vec::with_capacity(init_chunk_size);

    while let Some(item) = stream.next().await {
        pending.push(item);
        if pending.len() >= init_chunk_size {
            let group = std::mem::take(&mut pending);
            send_group(tx, group, max_batch_size).await;
        }
    }

    if !pending.is_empty() {
        send_group(tx, pending, max_batch_size).await;
    }
}

async fn send_group<Item>(tx: &mpsc::Sender<Message<Item>>, group: Vec<Item>, max_batch_size: usize) {
    let sub_queue: VecDeque<Record<Item>> = chunk(group, max_batch_size)
        .into_iter()
        .map(|segment| (segment, 0))
        .collect();
    let _ = tx.send(Message::AsyncEnqueue(sub_queue)).await;
}
