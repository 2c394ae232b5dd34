//! Buffered Batch Task Runner
//!
//! A long-lived async coordinator that accepts items from many producers,
//! batches them, and hands batches to a user-supplied [`Handler`] under a
//! bounded concurrency cap, with retry support and an optional one-shot
//! [`Streamer`] phase for draining a pre-existing backlog at startup.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use batch_runner::{BatchRunner, Config, Handler, Outcome, Streamer};
//! use async_trait::async_trait;
//! use futures::stream::{self, BoxStream};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl Handler<()> for PrintHandler {
//!     type Item = u32;
//!
//!     async fn run(&self, batch: Vec<u32>, _retries: u32, _state: &()) -> Outcome<u32> {
//!         println!("handling {} items", batch.len());
//!         Outcome::Ok
//!     }
//! }
//!
//! struct EmptyStreamer;
//!
//! impl Streamer<()> for EmptyStreamer {
//!     type Item = u32;
//!
//!     fn stream(&self, _state: Arc<()>) -> BoxStream<'static, u32> {
//!         Box::pin(stream::empty())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::builder()
//!         .flush_interval(Duration::from_millis(100))
//!         .max_concurrency(4)
//!         .max_batch_size(32)
//!         .init_chunk_size(32)
//!         .handler_state(())
//!         .build()?;
//!
//!     let runner = BatchRunner::start(PrintHandler, EmptyStreamer, config)?;
//!     runner.buffer(vec![1, 2, 3], Duration::from_secs(1)).await?;
//!     runner.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

mod batch;
mod config;
mod dispatcher;
mod error;
mod handler;
mod metrics;
mod runner;
mod staging;
mod streamer;
mod token;

pub use config::{Config, ConfigBuilder};
pub use error::{ConfigError, RunnerError};
pub use handler::{Handler, Outcome};
pub use metrics::Metrics;
pub use runner::BatchRunner;
pub use streamer::Streamer;
pub use token::Token;
