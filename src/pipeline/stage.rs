//! Generic bounded-concurrency stage runner.
//!
//! Every pipeline stage is the same machine: receive items on the input
//! channel, run a handler over each with at most `W` in flight, forward
//! the result on the output channel. A semaphore bounds admission, a
//! `JoinSet` tracks the in-flight tasks, and one cancellation token shuts
//! the stage down.
//!
//! # Cancellation contract
//!
//! On cancellation the stage stops admitting new items and waits for all
//! in-flight handlers to finish; nothing is aborted mid-item. An item
//! whose handler finishes after the signal is dropped instead of
//! forwarded, so in-flight work at shutdown never reaches the next stage
//! and is recovered from the durable source on the next run.
//!
//! # Ordering
//!
//! None. Workers run in parallel, so a later-dispatched item may finish
//! first; the state machine and the durable queue are designed for that.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::Item;

/// Minimum allowed worker count.
const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
const MAX_WORKERS: usize = 512;

/// Error type for stage construction.
#[derive(Debug, Error)]
pub enum StageError {
    /// Invalid worker count provided.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkerCount {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Per-item work performed by one stage.
///
/// The handler has exclusive ownership of the item for the duration of
/// the call; no other stage or worker can observe it meanwhile.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    /// Stage name, for logs.
    fn name(&self) -> &'static str;

    /// Processes one item and hands it back for forwarding.
    async fn handle(&self, item: Item) -> Item;
}

/// One pipeline stage: a worker pool around a [`StageHandler`].
#[derive(Debug)]
pub struct StageRunner<H> {
    handler: Arc<H>,
    workers: usize,
}

impl<H: StageHandler> StageRunner<H> {
    /// Creates a stage with the given worker concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::InvalidWorkerCount`] if the value is outside
    /// the valid range.
    pub fn new(handler: H, workers: usize) -> Result<Self, StageError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(StageError::InvalidWorkerCount { value: workers });
        }
        Ok(Self {
            handler: Arc::new(handler),
            workers,
        })
    }

    /// Runs the stage until the input closes or cancellation fires, then
    /// drains in-flight work and returns.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Item>,
        output: mpsc::Sender<Item>,
        cancel: CancellationToken,
    ) {
        let name = self.handler.name();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<()> = JoinSet::new();
        info!(stage = name, workers = self.workers, "stage started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(stage = name, "shutting down");
                    break;
                }
                received = input.recv() => {
                    let Some(item) = received else {
                        debug!(stage = name, "input closed");
                        break;
                    };
                    // Admission control: wait for a worker slot, but stop
                    // admitting the moment cancellation fires.
                    let permit = tokio::select! {
                        () = cancel.cancelled() => break,
                        acquired = Arc::clone(&semaphore).acquire_owned() => {
                            match acquired {
                                Ok(permit) => permit,
                                Err(_) => break,
                            }
                        }
                    };

                    let handler = Arc::clone(&self.handler);
                    let output = output.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let item = handler.handle(item).await;
                        tokio::select! {
                            () = cancel.cancelled() => {
                                // Drop-on-cancel: the item is abandoned here
                                // and recovered from the durable source.
                                debug!(stage = handler.name(), "dropping item finished after cancellation");
                            }
                            sent = output.send(item) => {
                                if sent.is_err() {
                                    debug!(stage = handler.name(), "output closed, dropping item");
                                }
                            }
                        }
                    });
                }
                // Reap finished tasks so the set does not grow unbounded.
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = joined {
                        warn!(stage = name, %error, "stage worker panicked");
                    }
                }
            }
        }

        // Drain: wait for every in-flight handler to run to completion.
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(stage = name, %error, "stage worker panicked");
            }
        }
        info!(stage = name, "stage stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::models::{ItemSource, Url};

    /// Handler that counts items and optionally dawdles.
    struct Counting {
        seen: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl StageHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, item: Item) -> Item {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            item
        }
    }

    fn item(raw: &str) -> Item {
        Item::new_seed(Url::new(raw), None, ItemSource::Insert)
    }

    #[test]
    fn test_worker_count_validation() {
        let seen = Arc::new(AtomicUsize::new(0));
        let make = |workers| {
            StageRunner::new(
                Counting {
                    seen: Arc::clone(&seen),
                    delay: Duration::ZERO,
                },
                workers,
            )
        };
        assert!(make(0).is_err());
        assert!(make(1).is_ok());
        assert!(make(513).is_err());
    }

    #[tokio::test]
    async fn test_items_flow_input_to_output() {
        let seen = Arc::new(AtomicUsize::new(0));
        let runner = StageRunner::new(
            Counting {
                seen: Arc::clone(&seen),
                delay: Duration::ZERO,
            },
            4,
        )
        .unwrap();

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let stage = tokio::spawn(runner.run(in_rx, out_tx, cancel));

        for index in 0..5 {
            in_tx.send(item(&format!("https://example.com/{index}"))).await.unwrap();
        }
        drop(in_tx);

        let mut received = 0;
        while out_rx.recv().await.is_some() {
            received += 1;
        }
        stage.await.unwrap();

        assert_eq!(received, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cancellation_drains_in_flight_and_drops_output() {
        let seen = Arc::new(AtomicUsize::new(0));
        let runner = StageRunner::new(
            Counting {
                seen: Arc::clone(&seen),
                delay: Duration::from_millis(50),
            },
            2,
        )
        .unwrap();

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let stage = tokio::spawn(runner.run(in_rx, out_tx, cancel.clone()));

        in_tx.send(item("https://example.com/a")).await.unwrap();
        in_tx.send(item("https://example.com/b")).await.unwrap();
        // Let both items enter their handlers, then cancel mid-flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        stage.await.unwrap();

        // In-flight handlers ran to completion...
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        // ...but their items were dropped, not forwarded.
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_stage_stops_admitting() {
        let seen = Arc::new(AtomicUsize::new(0));
        let runner = StageRunner::new(
            Counting {
                seen: Arc::clone(&seen),
                delay: Duration::ZERO,
            },
            1,
        )
        .unwrap();

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stage = tokio::spawn(runner.run(in_rx, out_tx, cancel));
        // The stage should exit without consuming anything.
        stage.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        drop(in_tx);
    }
}
