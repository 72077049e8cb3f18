use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every connection to `sqlite::memory:` opens its own database, so the
    // in-memory store is pinned to a single connection that never expires.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(600))
    };

    pool_options
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Opens the store at `database_url` and brings its schema up to date.
pub async fn connect(database_url: &str) -> Result<SqlitePool, crate::DbError> {
    let pool = create_pool(database_url).await?;
    run_migrations(&pool).await?;
    tracing::debug!(database_url, "State store ready");
    Ok(pool)
}
