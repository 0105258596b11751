use std::str::FromStr;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod apps;
pub mod instances;
pub mod tasks;

pub type Db = SqlitePool;

pub use apps::{AppRecord, AppStatus, NewRevision, RevisionRecord, RevisionStatus};
pub use instances::InstanceRecord;
pub use tasks::{NewTask, TaskRecord, TaskStatus, TaskType};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open the SQLite pool and bring the schema up to date.
pub async fn init_pool(database_url: &str) -> anyhow::Result<Db> {
    let options = SqliteConnectOptions::from_str(database_url)
        .context("parse database url")?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("open sqlite pool")?;

    MIGRATOR.run(&pool).await.context("run migrations")?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection is mandatory: every new
/// `:memory:` connection is a fresh empty database.
#[cfg(test)]
pub async fn test_pool() -> Db {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").expect("options");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("test pool");
    MIGRATOR.run(&pool).await.expect("test migrations");
    pool
}
