//! Local persistence on SQLite.
//!
//! One [`Store`] wraps the pool; the operation groups live in the
//! submodules (accounts, folders, messages, sync runs) as impl blocks on the
//! same type. All writes that must land together go through transactions.

pub mod accounts;
pub mod folders;
pub mod messages;
pub mod runs;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::SyncError;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating the file if needed) and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool. Used by tests running on `sqlite::memory:`.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, SyncError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
