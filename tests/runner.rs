use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use batch_runner::{BatchRunner, Config, Handler, Outcome, Streamer};
use futures::stream::{self, BoxStream};
use tokio::sync::Barrier;

/// Records every `(batch, retries)` pair a handler was invoked with, in
/// invocation order, and lets a test script an outcome per call index.
///
/// Cheaply `Clone`: the shared state lives behind `Arc`s, so a test keeps
/// one handle to inspect calls while handing another into `start`.
#[derive(Clone)]
struct ScriptedHandler {
    calls: Arc<Mutex<Vec<(Vec<u32>, u32)>>>,
    outcomes: Arc<Mutex<Vec<Outcome<u32>>>>,
}

impl ScriptedHandler {
    fn new(outcomes: Vec<Outcome<u32>>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            outcomes: Arc::new(Mutex::new(outcomes)),
        }
    }

    fn calls(&self) -> Vec<(Vec<u32>, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler<()> for ScriptedHandler {
    type Item = u32;

    async fn run(&self, batch: Vec<u32>, retries: u32, _state: &()) -> Outcome<u32> {
        self.calls.lock().unwrap().push((batch, retries));
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            Outcome::Ok
        } else {
            outcomes.remove(0)
        }
    }
}

/// Always-succeeds handler that counts concurrent invocations and blocks
/// each one on a shared barrier, for exercising the concurrency cap.
struct BarrierHandler {
    barrier: Arc<Barrier>,
    in_flight: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<()> for BarrierHandler {
    type Item = u32;

    async fn run(&self, batch: Vec<u32>, _retries: u32, _state: &()) -> Outcome<u32> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        self.barrier.wait().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = batch;
        Outcome::Ok
    }
}

/// Panics on the first call for a given batch, then succeeds.
struct PanicOnceHandler {
    panicked: Mutex<bool>,
}

#[async_trait]
impl Handler<()> for PanicOnceHandler {
    type Item = u32;

    async fn run(&self, _batch: Vec<u32>, retries: u32, _state: &()) -> Outcome<u32> {
        let mut panicked = self.panicked.lock().unwrap();
        if !*panicked {
            *panicked = true;
            drop(panicked);
            panic!("simulated handler crash at retries={retries}");
        }
        Outcome::Ok
    }
}

/// A handler whose invocations never return, for exercising shutdown's
/// abandonment-after-deadline path.
struct HangingHandler;

#[async_trait]
impl Handler<()> for HangingHandler {
    type Item = u32;

    async fn run(&self, _batch: Vec<u32>, _retries: u32, _state: &()) -> Outcome<u32> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Streamer that yields a fixed `Vec<u32>` once, with no delay.
struct VecStreamer(Vec<u32>);

impl Streamer<()> for VecStreamer {
    type Item = u32;

    fn stream(&self, _state: Arc<()>) -> BoxStream<'static, u32> {
        Box::pin(stream::iter(self.0.clone()))
    }
}

/// Streamer that yields one item every `delay`, for interleaving tests.
struct SlowStreamer {
    items: Vec<u32>,
    delay: Duration,
}

impl Streamer<()> for SlowStreamer {
    type Item = u32;

    fn stream(&self, _state: Arc<()>) -> BoxStream<'static, u32> {
        let items = self.items.clone();
        let delay = self.delay;
        Box::pin(stream::unfold(items.into_iter(), move |mut iter| async move {
            let next = iter.next()?;
            tokio::time::sleep(delay).await;
            Some((next, iter))
        }))
    }
}

struct EmptyStreamer;

impl Streamer<()> for EmptyStreamer {
    type Item = u32;

    fn stream(&self, _state: Arc<()>) -> BoxStream<'static, u32> {
        Box::pin(stream::empty())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_trivial_success_chunks_the_initial_stream() {
    let handler = ScriptedHandler::new(Vec::new());
    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(2)
        .max_batch_size(3)
        .init_chunk_size(5)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(handler.clone(), VecStreamer(vec![1, 2, 3, 4, 5, 6, 7]), config)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    runner.shutdown(Duration::from_secs(1)).await.unwrap();

    let mut calls = handler.calls();
    calls.sort_by_key(|(batch, _)| batch.clone());
    assert_eq!(
        calls,
        vec![
            (vec![1, 2, 3], 0),
            (vec![4, 5], 0),
            (vec![6, 7], 0),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_retry_then_succeed() {
    let handler = ScriptedHandler::new(vec![Outcome::Retry]);
    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(2)
        .max_batch_size(3)
        .init_chunk_size(5)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(handler.clone(), EmptyStreamer, config).unwrap();
    runner
        .buffer(vec![10, 11], Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    runner.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(
        handler.calls(),
        vec![(vec![10, 11], 0), (vec![10, 11], 1)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_handler_supplied_retry_payload() {
    let handler = ScriptedHandler::new(vec![Outcome::RetryWith(vec![99])]);
    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(2)
        .max_batch_size(3)
        .init_chunk_size(5)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(handler.clone(), EmptyStreamer, config).unwrap();
    runner
        .buffer(vec![10, 11], Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    runner.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(
        handler.calls(),
        vec![(vec![10, 11], 0), (vec![99], 1)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_concurrency_cap_is_enforced() {
    // 2 handler invocations plus this test task must all arrive before any
    // round releases, which forces exactly `max_concurrency` handlers to be
    // in flight simultaneously at every round.
    let barrier = Arc::new(Barrier::new(3));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let handler = BarrierHandler {
        barrier: Arc::clone(&barrier),
        in_flight: Arc::clone(&in_flight),
        max_observed: Arc::clone(&max_observed),
    };

    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(2)
        .max_batch_size(1)
        .init_chunk_size(10)
        .handler_state(())
        .build()
        .unwrap();

    let items: Vec<u32> = (0..100).collect();
    let runner = BatchRunner::start(handler, VecStreamer(items), config).unwrap();

    // Let a few rounds of (at most 2) handlers pile up on the barrier.
    for _ in 0..20 {
        barrier.wait().await;
    }

    assert!(max_observed.load(Ordering::SeqCst) <= 2);
    runner.shutdown(Duration::from_millis(500)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_crash_recovery_requeues_with_incremented_retries() {
    let handler = PanicOnceHandler {
        panicked: Mutex::new(false),
    };
    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(2)
        .max_batch_size(3)
        .init_chunk_size(5)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(handler, VecStreamer(vec![7, 8]), config).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    runner.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_interleaved_streamer_and_buffer_handles_every_item_once() {
    let handler = ScriptedHandler::new(Vec::new());
    let config = Config::builder()
        .flush_interval(Duration::from_millis(20))
        .max_concurrency(4)
        .max_batch_size(4)
        .init_chunk_size(3)
        .handler_state(())
        .build()
        .unwrap();

    let streamer = SlowStreamer {
        items: (1..=10).collect(),
        delay: Duration::from_millis(20),
    };
    let runner = BatchRunner::start(handler.clone(), streamer, config).unwrap();

    runner
        .buffer(vec![100, 101], Duration::from_secs(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    runner
        .buffer(vec![102], Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    runner.shutdown(Duration::from_secs(1)).await.unwrap();

    let mut seen: Vec<u32> = handler.calls().into_iter().flat_map(|(b, _)| b).collect();
    seen.sort_unstable();
    let mut expected: Vec<u32> = (1..=10).collect();
    expected.extend([100, 101, 102]);
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_abandons_in_flight_handlers_after_its_deadline() {
    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(1)
        .max_batch_size(1)
        .init_chunk_size(1)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(HangingHandler, VecStreamer(vec![1]), config).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    runner.shutdown(Duration::from_millis(100)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn metrics_reflects_staged_and_queued_items() {
    let handler = ScriptedHandler::new(Vec::new());
    let config = Config::builder()
        .flush_interval(Duration::from_secs(60))
        .max_concurrency(1)
        .max_batch_size(5)
        .init_chunk_size(5)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(handler, EmptyStreamer, config).unwrap();
    runner
        .buffer(vec![1, 2, 3], Duration::from_secs(1))
        .await
        .unwrap();

    let metrics = runner.metrics().await.unwrap();
    assert_eq!(metrics.buffer_gauge, 3);
    assert_eq!(metrics.task_gauge, 0);

    runner.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn a_clone_rejects_new_work_once_shutdown_has_begun() {
    use batch_runner::RunnerError;

    let handler = ScriptedHandler::new(Vec::new());
    let config = Config::builder()
        .flush_interval(Duration::from_millis(10))
        .max_concurrency(1)
        .max_batch_size(5)
        .init_chunk_size(5)
        .handler_state(())
        .build()
        .unwrap();

    let runner = BatchRunner::start(handler, EmptyStreamer, config).unwrap();
    let other_handle = runner.clone();

    runner.shutdown(Duration::from_secs(1)).await.unwrap();

    let result = other_handle
        .buffer(vec![1], Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RunnerError::ShuttingDown)));
}
