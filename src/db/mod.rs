use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub mod audit;
pub mod donations;
pub mod models;
pub mod notifications;
pub mod requests;
pub mod users;

pub use audit::*;
pub use donations::*;
pub use notifications::*;
pub use requests::*;
pub use users::*;

pub type DbPool = Pool<SqliteConnectionManager>;

pub const SCHEMA: &str = include_str!("../../migrations/init.sql");

pub const MEMORY_PATH: &str = ":memory:";

pub async fn init_pool(path: &str) -> anyhow::Result<DbPool> {
    let memory = path == MEMORY_PATH;
    let manager = if memory {
        SqliteConnectionManager::memory()
    } else {
        SqliteConnectionManager::file(path)
    }
    .with_init(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
    });

    let mut builder = Pool::builder()
        .max_size(10)
        .connection_timeout(std::time::Duration::from_secs(30));
    if memory {
        // Every in-memory connection is its own database: keep exactly one, forever.
        builder = builder.max_size(1).idle_timeout(None).max_lifetime(None);
    }

    let pool = builder
        .build(manager)
        .map_err(|e| anyhow::anyhow!("Failed to create DB pool: {}", e))?;

    with_conn(&pool, move |conn| {
        if !memory {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(())
    })
    .await?;

    Ok(pool)
}

/// Runs blocking SQLite work on the blocking thread pool with a pooled connection.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_initializes_schema() {
        let pool = init_pool(MEMORY_PATH).await.expect("init pool");
        let tables: i64 = with_conn(&pool, |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'donations', 'notifications', 'requests', 'audit_logs')",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .expect("count tables");
        assert_eq!(tables, 5);
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = init_pool(MEMORY_PATH).await.expect("init pool");
        with_conn(&pool, |conn| Ok(conn.execute_batch(SCHEMA)?))
            .await
            .expect("reapply schema");
    }
}
