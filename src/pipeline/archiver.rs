//! Archive stage: fetch the URL and attach the response.
//!
//! The actual fetching (and any WARC writing behind it) is an external
//! collaborator behind the [`Fetcher`] trait; this handler owns only the
//! item bookkeeping around it. Fetch failures are item failures, never
//! process failures.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::stage::StageHandler;
use crate::fetcher::Fetcher;
use crate::models::{Item, ItemStatus};
use crate::stats::PipelineStats;

/// Handler for the archive stage.
pub struct Archiver {
    fetcher: Arc<dyn Fetcher>,
    stats: Arc<PipelineStats>,
}

impl Archiver {
    /// Creates the handler around an external fetcher.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, stats: Arc<PipelineStats>) -> Self {
        Self { fetcher, stats }
    }
}

#[async_trait]
impl StageHandler for Archiver {
    fn name(&self) -> &'static str {
        "archiver"
    }

    async fn handle(&self, mut item: Item) -> Item {
        let root = item.root();
        if item.node(root).status() != ItemStatus::PreProcessed {
            return item;
        }

        match self.fetcher.fetch(item.node(root).url()).await {
            Ok(response) => {
                debug!(
                    item = item.node(root).short_id(),
                    status_code = response.status_code(),
                    "response archived"
                );
                item.node_mut(root).url_mut().set_response(response);
                if let Err(error) = item.set_status(root, ItemStatus::Archived) {
                    error!(item = item.node(root).short_id(), %error, "item state machine violated");
                }
                self.stats.record_archived();
            }
            Err(fetch_error) => {
                warn!(
                    item = item.node(root).short_id(),
                    url = item.node(root).url().raw(),
                    error = %fetch_error,
                    "fetch failed"
                );
                item.set_error(root, fetch_error.to_string());
                if let Err(error) = item.set_status(root, ItemStatus::Failed) {
                    error!(item = item.node(root).short_id(), %error, "item state machine violated");
                }
            }
        }
        item
    }
}
