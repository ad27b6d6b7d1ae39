//! In-process pipeline counters.
//!
//! Metrics backends are out of scope; these atomic counters are the surface
//! they would scrape. Updated from concurrent stage workers, so all
//! counters are atomics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pulled: AtomicU64,
    preprocessed: AtomicU64,
    archived: AtomicU64,
    postprocessed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    children_discovered: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Items pulled from the source.
    pub pulled: u64,
    /// Items that passed pre-processing.
    pub preprocessed: u64,
    /// Items with a fetched response attached.
    pub archived: u64,
    /// Items that finished post-processing.
    pub postprocessed: u64,
    /// Items marked done after completing.
    pub completed: u64,
    /// Items marked done after failing.
    pub failed: u64,
    /// Child URLs attached across all items.
    pub children_discovered: u64,
}

impl PipelineStats {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_pulled(&self) {
        self.pulled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_preprocessed(&self) {
        self.preprocessed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_archived(&self) {
        self.archived.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_postprocessed(&self) {
        self.postprocessed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_children_discovered(&self, count: u64) {
        self.children_discovered.fetch_add(count, Ordering::SeqCst);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pulled: self.pulled.load(Ordering::SeqCst),
            preprocessed: self.preprocessed.load(Ordering::SeqCst),
            archived: self.archived.load(Ordering::SeqCst),
            postprocessed: self.postprocessed.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            children_discovered: self.children_discovered.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pulled={} preprocessed={} archived={} postprocessed={} completed={} failed={} children={}",
            self.pulled,
            self.preprocessed,
            self.archived,
            self.postprocessed,
            self.completed,
            self.failed,
            self.children_discovered
        )
    }
}
