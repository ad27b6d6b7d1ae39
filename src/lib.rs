//! Magpie core library
//!
//! Magpie is a web archival crawler: it ingests seed URLs, fetches them,
//! extracts embedded references (assets and outlinks), and emits items for
//! downstream archival.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`models`] - Item tree and URL records with lifecycle state
//! - [`source`] - Frontier adapters: local durable queue and remote HQ
//! - [`pipeline`] - Stage runner, supervisor, and per-stage handlers
//! - [`postprocessor`] - Redirect handling and asset/outlink extraction
//! - [`fetcher`] - HTTP fetching contract consumed by the archive stage
//! - [`db`] - Database connection and schema management
//!
//! Items flow source → pre-process → archive → post-process, then feed back
//! to the source: discovered children re-enter as fresh items, terminal
//! items are marked done in the durable store.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod fetcher;
pub mod models;
pub mod pipeline;
pub mod postprocessor;
pub mod source;
pub mod stats;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use db::Database;
pub use fetcher::{FetchError, Fetcher, HttpFetcher};
pub use models::{Body, Item, ItemSource, ItemStatus, NodeId, Response, Url, UrlKind};
pub use pipeline::{PipelineError, Supervisor};
pub use source::{LocalQueue, LqError, QueuedUrl, SourceError, UrlSource};
pub use stats::PipelineStats;
