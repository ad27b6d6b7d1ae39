//! Pre-process stage: URL parsing and validation.
//!
//! Prepares fresh items for capture: the URL is parsed once here and every
//! later stage works with the cached parsed form. Items that fail
//! validation are failed in place and carried forward so the feedback loop
//! can acknowledge them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::stage::StageHandler;
use crate::models::{Item, ItemStatus};
use crate::stats::PipelineStats;

/// Handler for the pre-process stage.
#[derive(Debug)]
pub struct Preprocessor {
    stats: Arc<PipelineStats>,
}

impl Preprocessor {
    /// Creates the handler.
    #[must_use]
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl StageHandler for Preprocessor {
    fn name(&self) -> &'static str {
        "preprocessor"
    }

    async fn handle(&self, mut item: Item) -> Item {
        let root = item.root();
        // Items that already failed upstream pass through untouched.
        if item.node(root).status() != ItemStatus::Fresh {
            return item;
        }

        match item.node_mut(root).url_mut().parse() {
            Ok(()) => {
                if let Err(error) = item.set_status(root, ItemStatus::PreProcessed) {
                    error!(item = item.node(root).short_id(), %error, "item state machine violated");
                }
                self.stats.record_preprocessed();
            }
            Err(parse_error) => {
                warn!(
                    item = item.node(root).short_id(),
                    url = item.node(root).url().raw(),
                    error = %parse_error,
                    "url failed validation"
                );
                item.set_error(root, parse_error.to_string());
                if let Err(error) = item.set_status(root, ItemStatus::Failed) {
                    error!(item = item.node(root).short_id(), %error, "item state machine violated");
                }
            }
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemSource, Url};

    fn handler() -> Preprocessor {
        Preprocessor::new(Arc::new(PipelineStats::new()))
    }

    #[tokio::test]
    async fn test_valid_url_advances_to_preprocessed() {
        let item = Item::new_seed(
            Url::new("https://example.com/page"),
            None,
            ItemSource::Queue,
        );
        let item = handler().handle(item).await;
        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::PreProcessed);
        assert_eq!(item.node(root).url().host(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_the_item() {
        let item = Item::new_seed(Url::new("ftp://example.com/f"), None, ItemSource::Queue);
        let item = handler().handle(item).await;
        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::Failed);
        assert!(item.node(root).err().is_some());
    }

    #[tokio::test]
    async fn test_non_fresh_item_passes_through() {
        let mut item = Item::new_seed(Url::new("https://example.com/"), None, ItemSource::Queue);
        let root = item.root();
        item.set_status(root, ItemStatus::Failed).ok();

        let item = handler().handle(item).await;
        assert_eq!(item.node(item.root()).status(), ItemStatus::Failed);
    }
}
