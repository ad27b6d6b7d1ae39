//! Top-level supervisor: owns the cancellation handle, wires the stages,
//! and routes post-processed items back to the source.
//!
//! Stages are constructed as values and connected with explicit channels;
//! there is no hidden global state. The feedback loop is where an item's
//! subtree is flattened back into frontier rows: fresh children are
//! re-enqueued (outlinks may instead go to an external topic), redirect
//! targets are re-injected as fresh items, and terminal items are marked
//! done in the durable store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::archiver::Archiver;
use super::preprocessor::Preprocessor;
use super::stage::StageRunner;
use super::PipelineError;
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::models::{Item, ItemSource, ItemStatus, NodeId, Url, UrlKind};
use crate::postprocessor::Postprocessor;
use crate::source::{QueuedUrl, UrlSource};
use crate::stats::PipelineStats;

/// How long the pull loop sleeps when the source hands back nothing but
/// items are still in flight.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The pipeline supervisor.
pub struct Supervisor {
    config: Arc<Config>,
    source: Arc<dyn UrlSource>,
    fetcher: Arc<dyn Fetcher>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    outlink_sink: Option<mpsc::Sender<QueuedUrl>>,
}

impl Supervisor {
    /// Creates a supervisor over a source and a fetcher.
    #[must_use]
    pub fn new(config: Config, source: Arc<dyn UrlSource>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config: Arc::new(config),
            source,
            fetcher,
            stats: Arc::new(PipelineStats::new()),
            cancel: CancellationToken::new(),
            outlink_sink: None,
        }
    }

    /// Returns a clone of the cancellation handle. Cancelling it stops
    /// the pull loop, drains in-flight work, and shuts every stage down.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the shared pipeline counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Routes discovered outlinks to `sink` instead of the source.
    ///
    /// Takes effect when `use_kafka` is configured: the sink stands for
    /// the topic producer, which is an external collaborator. Assets
    /// always go back to the source.
    pub fn route_outlinks_to(&mut self, sink: mpsc::Sender<QueuedUrl>) {
        self.outlink_sink = Some(sink);
    }

    /// Runs the pipeline until cancellation, source exhaustion, or a
    /// fatal source error.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for fatal conditions only; per-item
    /// failures are absorbed into the items themselves.
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<(), PipelineError> {
        let capacity = self.config.channel_capacity;
        let (pre_tx, pre_rx) = mpsc::channel::<Item>(capacity);
        let (archive_tx, archive_rx) = mpsc::channel::<Item>(capacity);
        let (post_tx, post_rx) = mpsc::channel::<Item>(capacity);
        let (feedback_tx, feedback_rx) = mpsc::channel::<Item>(capacity);

        let workers = self.config.workers_count;
        let preprocessor = StageRunner::new(Preprocessor::new(self.stats()), workers)?;
        let archiver = StageRunner::new(
            Archiver::new(Arc::clone(&self.fetcher), self.stats()),
            workers,
        )?;
        let postprocessor = StageRunner::new(
            Postprocessor::new(Arc::clone(&self.config), self.stats()),
            workers,
        )?;

        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        handles.push(tokio::spawn(preprocessor.run(
            pre_rx,
            archive_tx,
            self.cancel.clone(),
        )));
        handles.push(tokio::spawn(archiver.run(
            archive_rx,
            post_tx,
            self.cancel.clone(),
        )));
        handles.push(tokio::spawn(postprocessor.run(
            post_rx,
            feedback_tx,
            self.cancel.clone(),
        )));

        let router = FeedbackRouter {
            config: Arc::clone(&self.config),
            source: Arc::clone(&self.source),
            stats: self.stats(),
            in_flight: Arc::clone(&in_flight),
            cancel: self.cancel.clone(),
            reinject: pre_tx.clone(),
            outlink_sink: self.outlink_sink.clone(),
        };
        handles.push(tokio::spawn(router.run(feedback_rx)));

        info!("pipeline started");
        let result = self.pull_loop(pre_tx, &in_flight).await;

        // Whether we exhausted the source or hit a fatal error, the same
        // broadcast brings every stage down gracefully.
        self.cancel.cancel();
        for handle in handles {
            if let Err(join_error) = handle.await {
                warn!(error = %join_error, "pipeline task panicked");
            }
        }
        info!(stats = %self.stats.snapshot(), "pipeline stopped");
        result
    }

    /// Pulls batches from the source and dispatches them into the first
    /// stage until cancellation or exhaustion.
    async fn pull_loop(
        &self,
        pre_tx: mpsc::Sender<Item>,
        in_flight: &AtomicUsize,
    ) -> Result<(), PipelineError> {
        loop {
            let batch = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                pulled = self.source.pull(self.config.pull_batch_size) => pulled?,
            };

            if batch.is_empty() {
                if in_flight.load(Ordering::SeqCst) == 0 {
                    info!("source exhausted, shutting down");
                    return Ok(());
                }
                tokio::select! {
                    () = self.cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                continue;
            }

            for queued in batch {
                let url = Url::new(queued.value).with_hops(queued.hops);
                let item = Item::new_seed(url, queued.via, self.source.origin())
                    .with_queue_id(queued.id);

                in_flight.fetch_add(1, Ordering::SeqCst);
                self.stats.record_pulled();
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    sent = pre_tx.send(item) => {
                        if sent.is_err() {
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Routes items leaving the post-process stage.
struct FeedbackRouter {
    config: Arc<Config>,
    source: Arc<dyn UrlSource>,
    stats: Arc<PipelineStats>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    reinject: mpsc::Sender<Item>,
    outlink_sink: Option<mpsc::Sender<QueuedUrl>>,
}

impl FeedbackRouter {
    async fn run(self, mut input: mpsc::Receiver<Item>) {
        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => break,
                received = input.recv() => {
                    let Some(item) = received else { break };
                    item
                }
            };
            self.route(item).await;
        }
        debug!("feedback router stopped");
    }

    async fn route(&self, mut item: Item) {
        let root = item.root();
        match item.node(root).status() {
            ItemStatus::GotRedirected => self.reinject_redirect(item).await,
            ItemStatus::PostProcessed | ItemStatus::GotChildren => self.complete(item).await,
            ItemStatus::Failed => self.finish(item, false).await,
            status => {
                error!(
                    item = item.node(root).short_id(),
                    %status,
                    "unexpected item status in feedback, failing it"
                );
                item.set_error(root, format!("unexpected status {status} in feedback"));
                if item.set_status(root, ItemStatus::Failed).is_err() {
                    // Already terminal; fall through to acknowledgement.
                }
                self.finish(item, false).await;
            }
        }
    }

    /// Re-injects the redirection target as a fresh item continuing the
    /// same crawl (and the same durable row).
    async fn reinject_redirect(&self, mut item: Item) {
        let root = item.root();
        let Some(target) = item.node_mut(root).take_redirection() else {
            error!(
                item = item.node(root).short_id(),
                "redirected item carries no redirection target"
            );
            self.finish(item, false).await;
            return;
        };

        debug!(
            item = item.node(root).short_id(),
            target = target.raw(),
            redirects = target.redirects(),
            "following redirect"
        );
        let mut follow_up = Item::new_seed(target, None, ItemSource::Feedback);
        if let Some(queue_id) = item.queue_id() {
            follow_up = follow_up.with_queue_id(queue_id);
        }

        tokio::select! {
            () = self.cancel.cancelled() => {
                // Dropped on shutdown; the claimed row recovers next run.
            }
            sent = self.reinject.send(follow_up) => {
                if sent.is_err() {
                    debug!("pipeline input closed, dropping redirect follow-up");
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        // The original item is destroyed here; its durable row stays
        // claimed until the chain reaches a terminal state.
    }

    /// Flattens fresh children into frontier rows, then acknowledges the
    /// item as completed.
    async fn complete(&self, mut item: Item) {
        let root = item.root();
        let discovered = self.collect_children(&item, root);

        let discovered = if self.source.supports_seencheck() {
            self.source.seencheck(discovered).await
        } else {
            discovered
        };

        let (outlinks, assets): (Vec<QueuedUrl>, Vec<QueuedUrl>) = discovered
            .into_iter()
            .partition(|url| url.kind != UrlKind::Asset);

        if !assets.is_empty() {
            if let Err(push_error) = self.source.push(assets, false).await {
                warn!(error = %push_error, "failed to enqueue discovered assets");
            }
        }
        self.dispatch_outlinks(outlinks).await;

        if let Err(error) = item.set_status(root, ItemStatus::Completed) {
            error!(item = item.node(root).short_id(), %error, "item state machine violated");
        }
        self.finish(item, true).await;
    }

    /// Collects the fresh children of `root` as frontier rows, applying
    /// the hop limit.
    fn collect_children(&self, item: &Item, root: NodeId) -> Vec<QueuedUrl> {
        let parent_value = item.node(root).url().raw().to_string();
        let mut collected = Vec::new();
        for &child in item.node(root).children() {
            let node = item.node(child);
            if node.status() != ItemStatus::Fresh {
                continue;
            }
            if node.url().hops() > self.config.max_hops {
                debug!(url = node.url().raw(), hops = node.url().hops(), "hop limit reached, dropping");
                continue;
            }
            collected.push(QueuedUrl {
                id: String::new(),
                value: node.url().raw().to_string(),
                via: Some(parent_value.clone()),
                hops: node.url().hops(),
                kind: node.kind(),
            });
        }
        collected
    }

    /// Sends outlinks to the external topic when configured, otherwise
    /// back to the in-process frontier.
    async fn dispatch_outlinks(&self, outlinks: Vec<QueuedUrl>) {
        if outlinks.is_empty() {
            return;
        }
        if self.config.use_kafka {
            if let Some(sink) = &self.outlink_sink {
                for outlink in outlinks {
                    if sink.send(outlink).await.is_err() {
                        warn!("outlink sink closed, remaining outlinks dropped");
                        return;
                    }
                }
                return;
            }
            warn!("use_kafka set but no outlink sink attached, falling back to the source");
        }
        if let Err(push_error) = self.source.push(outlinks, false).await {
            warn!(error = %push_error, "failed to enqueue discovered outlinks");
        }
    }

    /// Acknowledges a terminal item: count it, mark its durable row done,
    /// release its in-flight slot, and destroy the tree.
    async fn finish(&self, item: Item, completed: bool) {
        if completed {
            self.stats.record_completed();
        } else {
            self.stats.record_failed();
        }
        if let Some(queue_id) = item.queue_id() {
            if let Err(done_error) = self.source.mark_done(&[queue_id.to_string()]).await {
                warn!(error = %done_error, "failed to mark url done in source");
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        // Dropping the item drops the whole subtree.
    }
}
