//! Local queue: the durable frontier used when no coordinator is attached.
//!
//! A single SQLite table tracks every URL the crawl knows about, keyed by
//! value so re-discovery is a constraint-level no-op. The queue is a
//! SINGLE-WRITER system: the one pooled connection performs all writes and
//! the engine serializes them, trading throughput for the absence of write
//! conflicts and a trivially recoverable crash story.
//!
//! Lifecycle of a row: `fresh` → `claimed` (invisible to further pulls) →
//! `done`. Claimed rows left behind by a crash return to `fresh` via
//! [`LocalQueue::reset_claimed`] on the next run.

use std::path::Path;

use async_trait::async_trait;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{QueuedUrl, SourceError, UrlSource};
use crate::db::{Database, DbError};
use crate::models::{ItemSource, UrlKind};

/// File name of the queue database inside the job directory.
const LQ_DB_FILE: &str = "lq.db";

/// Classification of database failures, for handling and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LqDbErrorKind {
    /// SQLite returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure other than the silently-skipped duplicate value.
    ConstraintViolation,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl LqDbErrorKind {
    #[must_use]
    fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(code.as_deref(), Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")) {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_check_violation()
                    || code
                        .as_deref()
                        .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for LqDbErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors from local queue operations.
///
/// A duplicate URL on insert is NOT one of these: the unique constraint on
/// `value` is the deduplication mechanism and hitting it is a silent skip.
#[derive(Debug, Error)]
pub enum LqError {
    /// The database could not be opened.
    #[error("failed to open local queue: {0}")]
    Open(#[source] DbError),

    /// The schema could not be initialized.
    #[error("failed to initialize local queue schema: {0}")]
    Schema(#[source] DbError),

    /// A transaction could not begin or commit.
    #[error("transaction {op} failed: {message}")]
    Tx {
        /// Either `begin` or `commit`.
        op: &'static str,
        /// Database error text.
        message: String,
    },

    /// A statement inside a transaction failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification.
        kind: LqDbErrorKind,
        /// Database error text.
        message: String,
    },

    /// The named URL does not exist in the queue.
    #[error("url not found in local queue: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for LqError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database {
            kind: LqDbErrorKind::from_sqlx(&error),
            message: error.to_string(),
        }
    }
}

impl From<DbError> for LqError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::Open(_) => Self::Open(error),
            DbError::Schema(_) => Self::Schema(error),
        }
    }
}

/// Row shape of the `urls` table.
#[derive(Debug, FromRow)]
struct UrlRow {
    id: String,
    value: String,
    via: Option<String>,
    hops: i64,
}

impl From<UrlRow> for QueuedUrl {
    fn from(row: UrlRow) -> Self {
        Self {
            id: row.id,
            value: row.value,
            via: row.via,
            hops: u32::try_from(row.hops).unwrap_or(0),
            kind: UrlKind::Seed,
        }
    }
}

/// The durable, single-writer work queue.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    db: Database,
}

impl LocalQueue {
    /// Opens (or creates) the queue database at `{job_path}/lq.db`.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Open`] or [`LqError::Schema`]. Both are fatal;
    /// the caller must abort.
    #[instrument(skip(job_path), fields(job_path = %job_path.display()))]
    pub async fn open(job_path: &Path) -> Result<Self, LqError> {
        let db = Database::open(&job_path.join(LQ_DB_FILE)).await?;
        Ok(Self { db })
    }

    /// Creates an in-memory queue for testing.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Open`] or [`LqError::Schema`].
    pub async fn in_memory() -> Result<Self, LqError> {
        let db = Database::in_memory().await?;
        Ok(Self { db })
    }

    /// Adds URLs to the queue in one transaction.
    ///
    /// URLs without an id get a fresh UUID. A UNIQUE violation on `value`
    /// means the URL is already known and is skipped silently; any other
    /// failure rolls back the entire batch.
    ///
    /// `_bypass_seencheck` is part of the source contract; the local queue
    /// has no external seencheck, its unique constraint is the membership
    /// check.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Tx`] or [`LqError::Database`]; nothing is added
    /// in that case.
    #[instrument(skip(self, urls), fields(count = urls.len()))]
    pub async fn add(&self, urls: Vec<QueuedUrl>, _bypass_seencheck: bool) -> Result<(), LqError> {
        let mut tx = self.db.pool().begin().await.map_err(|error| LqError::Tx {
            op: "begin",
            message: error.to_string(),
        })?;

        for mut url in urls {
            if url.id.is_empty() {
                url.id = Uuid::new_v4().to_string();
            }
            let result = sqlx::query(
                r"INSERT INTO urls (id, value, via, hops, status)
                  VALUES (?, ?, ?, ?, 'fresh')",
            )
            .bind(&url.id)
            .bind(&url.value)
            .bind(&url.via)
            .bind(i64::from(url.hops))
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                    debug!(value = %url.value, "url already in queue, skipping");
                }
                Err(error) => return Err(error.into()),
            }
        }

        tx.commit().await.map_err(|error| LqError::Tx {
            op: "commit",
            message: error.to_string(),
        })?;
        Ok(())
    }

    /// Claims up to `limit` fresh URLs in one transaction.
    ///
    /// Each returned row is marked `claimed` before the commit, so it is
    /// invisible to further calls. If the commit fails nothing is claimed.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Tx`] or [`LqError::Database`].
    #[instrument(skip(self))]
    pub async fn get(&self, limit: usize) -> Result<Vec<QueuedUrl>, LqError> {
        let mut tx = self.db.pool().begin().await.map_err(|error| LqError::Tx {
            op: "begin",
            message: error.to_string(),
        })?;

        let rows: Vec<UrlRow> = sqlx::query_as(
            r"SELECT id, value, via, hops FROM urls WHERE status = 'fresh' LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query(
                r"UPDATE urls
                  SET status = 'claimed', claimed_at = strftime('%s', 'now')
                  WHERE id = ?",
            )
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(|error| LqError::Tx {
            op: "commit",
            message: error.to_string(),
        })?;

        Ok(rows.into_iter().map(QueuedUrl::from).collect())
    }

    /// Marks URLs done in one transaction. Idempotent on already-done rows.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Tx`] or [`LqError::Database`].
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn done(&self, ids: &[String]) -> Result<(), LqError> {
        let mut tx = self.db.pool().begin().await.map_err(|error| LqError::Tx {
            op: "begin",
            message: error.to_string(),
        })?;

        for id in ids {
            sqlx::query(r"UPDATE urls SET status = 'done' WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await.map_err(|error| LqError::Tx {
            op: "commit",
            message: error.to_string(),
        })?;
        Ok(())
    }

    /// Forces a URL back to `fresh` for replay after operator
    /// intervention.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::NotFound`] when no row has that value.
    #[instrument(skip(self))]
    pub async fn reset_url(&self, value: &str) -> Result<(), LqError> {
        let result = sqlx::query(
            r"UPDATE urls SET status = 'fresh', claimed_at = NULL WHERE value = ?",
        )
        .bind(value)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LqError::NotFound(value.to_string()));
        }
        Ok(())
    }

    /// Returns all claimed rows to `fresh`.
    ///
    /// Called at startup for crash recovery: rows left `claimed` by a
    /// previous run were in flight when it stopped and must be replayed.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_claimed(&self) -> Result<u64, LqError> {
        let result = sqlx::query(
            r"UPDATE urls
              SET status = 'fresh', claimed_at = NULL
              WHERE status = 'claimed'",
        )
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Counts rows in a status. Used by tests and the completion summary.
    ///
    /// # Errors
    ///
    /// Returns [`LqError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: &str) -> Result<i64, LqError> {
        let row: (i64,) = sqlx::query_as(r"SELECT COUNT(*) FROM urls WHERE status = ?")
            .bind(status)
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl UrlSource for LocalQueue {
    fn origin(&self) -> ItemSource {
        ItemSource::Queue
    }

    async fn pull(&self, limit: usize) -> Result<Vec<QueuedUrl>, SourceError> {
        Ok(self.get(limit).await?)
    }

    async fn push(&self, urls: Vec<QueuedUrl>, bypass_seencheck: bool) -> Result<(), SourceError> {
        Ok(self.add(urls, bypass_seencheck).await?)
    }

    async fn mark_done(&self, ids: &[String]) -> Result<(), SourceError> {
        Ok(self.done(ids).await?)
    }
}
