//! Database connection and schema management for the local queue.
//!
//! This module provides SQLite database connectivity with:
//! - A single-writer connection (the queue serializes all writes)
//! - WAL mode so readers never block on the writer
//! - Automatic migration execution
//!
//! # Example
//!
//! ```no_run
//! use magpie::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open(Path::new("lq.db")).await?;
//! // Use db for queries...
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Maximum open connections. Exactly one: the queue is a single-writer
/// system and the engine must never see two concurrent writers.
const MAX_CONNECTIONS: u32 = 1;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to open the database.
    #[error("failed to open database: {0}")]
    Open(#[from] sqlx::Error),

    /// Failed to initialize the schema.
    #[error("failed to initialize schema: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),
}

/// Database connection wrapper.
///
/// Handles SQLite connection setup, WAL mode configuration, and automatic
/// migration execution.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database at the specified path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode
    /// 3. Run any pending migrations
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the connection fails,
    /// or [`DbError::Schema`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        // Set busy timeout to avoid immediate lock errors
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// The database exists only for the lifetime of the connection. WAL
    /// mode is not enabled for in-memory databases as it provides no
    /// benefit.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the connection fails,
    /// or [`DbError::Schema`] if migrations fail.
    #[instrument]
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes the connection.
    ///
    /// This should be called before the process exits. After calling this
    /// method, the Database instance should not be used.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
