//! Database connection management

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Type alias for the database pool
pub type DbPool = SqlitePool;

/// Used when DATABASE_URL is not set
pub const DEFAULT_DATABASE_URL: &str = "sqlite://taskq.db";

/// Create a new database connection pool
///
/// In-memory databases are private to a connection, so they get a pool of
/// exactly one connection that is never recycled.
///
/// # Example
/// ```ignore
/// let pool = create_pool("sqlite://tasks.db").await?;
/// ```
pub async fn create_pool(database_url: &str) -> Result<DbPool> {
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
    pool_options = if in_memory {
        // Closing the only connection would drop the whole database
        pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(5)
    };

    let pool = pool_options.connect_with(options).await?;

    Ok(pool)
}

/// Create a pool from DATABASE_URL environment variable
pub async fn create_pool_from_env() -> Result<DbPool> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

    create_pool(&database_url).await
}
