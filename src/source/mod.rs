//! Frontier sources: where items come from and where discoveries go back.
//!
//! Two implementations share one seam: the local durable queue
//! ([`LocalQueue`]) used when the crawler runs standalone, and the remote
//! coordinator adapter ([`HqClient`]) used when a crawl is orchestrated
//! externally. The supervisor picks one at startup and only ever talks to
//! the trait.

pub mod hq;
pub mod lq;

use async_trait::async_trait;
use thiserror::Error;

pub use hq::{HqClient, HqError, WireUrl};
pub use lq::{LocalQueue, LqError};

use crate::models::{ItemSource, UrlKind};

/// A URL as held by a source: durable row id, raw value, provenance, and
/// hop count. The id is adapter-opaque; an empty id on push means "assign
/// one".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUrl {
    /// Adapter-opaque row identifier.
    pub id: String,
    /// The raw URL value.
    pub value: String,
    /// Free-text provenance (usually the discovering page).
    pub via: Option<String>,
    /// Distance from the original seed.
    pub hops: u32,
    /// Wire classification of the URL.
    pub kind: UrlKind,
}

impl QueuedUrl {
    /// Builds a seed-kind URL with no id (the adapter assigns one).
    #[must_use]
    pub fn seed(value: impl Into<String>, via: Option<String>) -> Self {
        Self {
            id: String::new(),
            value: value.into(),
            via,
            hops: 0,
            kind: UrlKind::Seed,
        }
    }
}

/// Errors from source operations.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Local queue failure.
    #[error(transparent)]
    Lq(#[from] LqError),

    /// Remote coordinator failure.
    #[error(transparent)]
    Hq(#[from] HqError),
}

/// The source adapter seam: pull work, push discoveries, acknowledge
/// completion, and optionally filter through an external seencheck.
#[async_trait]
pub trait UrlSource: Send + Sync + 'static {
    /// Which [`ItemSource`] tag items pulled from this adapter carry.
    fn origin(&self) -> ItemSource;

    /// Claims up to `limit` URLs for processing. Claimed URLs are
    /// invisible to further pulls.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on storage or transport failure; nothing
    /// is claimed in that case.
    async fn pull(&self, limit: usize) -> Result<Vec<QueuedUrl>, SourceError>;

    /// Enqueues discovered URLs. Duplicates are skipped silently.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on storage or transport failure; the whole
    /// batch is rolled back in that case.
    async fn push(&self, urls: Vec<QueuedUrl>, bypass_seencheck: bool) -> Result<(), SourceError>;

    /// Marks claimed URLs done. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on storage or transport failure.
    async fn mark_done(&self, ids: &[String]) -> Result<(), SourceError>;

    /// Whether [`seencheck`](Self::seencheck) does anything beyond the
    /// fall-open default.
    fn supports_seencheck(&self) -> bool {
        false
    }

    /// Returns the subset of `urls` the coordinator considers unseen.
    ///
    /// Failure falls open: implementations log and return the full input
    /// rather than dropping discoveries, preferring availability.
    async fn seencheck(&self, urls: Vec<QueuedUrl>) -> Vec<QueuedUrl> {
        urls
    }
}
