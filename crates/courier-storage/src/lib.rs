//! # Courier Storage
//!
//! SQLite backends for the Courier [`SessionStore`](courier_core::SessionStore)
//! and [`TopicCache`](courier_core::TopicCache) contracts, built on `sqlx`.
//!
//! ```rust,ignore
//! let pool = courier_storage::connect("sqlite://courier.db").await?;
//! let sessions = SqliteSessionStore::new(pool.clone());
//! sessions.init().await?;
//! let topics = SqliteTopicCache::new(pool);
//! topics.init().await?;
//! ```

pub mod session;
pub mod topic;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use courier_core::{StoreError, StoreResult};

pub use session::SqliteSessionStore;
pub use topic::SqliteTopicCache;

/// Opens a pool on `url`, creating the database file if needed.
pub async fn connect(url: &str) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(map_sqlx_error)?
        .create_if_missing(true);
    pool_options(url)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)
}

/// `sqlite::memory:` gives each connection its own database, so an
/// in-memory pool holds exactly one connection that is never recycled.
fn pool_options(url: &str) -> SqlitePoolOptions {
    if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    }
}

/// Maps a driver error onto the store taxonomy.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    connect("sqlite::memory:").await.unwrap()
}
