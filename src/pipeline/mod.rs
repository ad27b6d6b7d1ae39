//! The staged pipeline: source → pre-process → archive → post-process →
//! feedback.
//!
//! Each stage is a [`StageRunner`] with its own worker pool and
//! input/output channels; the [`Supervisor`] constructs the stages as
//! values, wires the channels explicitly, and holds the one cancellation
//! handle that shuts everything down.

mod archiver;
mod preprocessor;
mod stage;
mod supervisor;

pub use archiver::Archiver;
pub use preprocessor::Preprocessor;
pub use stage::{StageError, StageHandler, StageRunner};
pub use supervisor::Supervisor;

use thiserror::Error;

use crate::source::SourceError;

/// Fatal pipeline errors. Per-item failures never surface here; they
/// advance the item to `Failed` instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage could not be constructed.
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// The source failed in a way that compromises the crawl.
    #[error("source error: {0}")]
    Source(#[from] SourceError),
}
