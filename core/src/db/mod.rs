use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;
use tracing::info;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Initialize database with connection pool and run migrations.
///
/// Without a path the database lives in memory. Every pooled connection to
/// `:memory:` would open a separate database, so that pool holds one.
pub fn init_db(db_path: Option<PathBuf>) -> Result<DbPool> {
    let (manager, max_size) = match db_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create data directory {:?}", parent))?;
            }
            info!("Initializing database at: {:?}", path);
            (SqliteConnectionManager::file(&path), 10)
        }
        None => {
            info!("Initializing in-memory database");
            (SqliteConnectionManager::memory(), 1)
        }
    };

    let pool = Pool::builder()
        .max_size(max_size)
        .build(manager)
        .context("Failed to create connection pool")?;

    let conn = pool.get().context("Failed to get database connection")?;
    run_migrations(&conn)?;

    info!("Database initialized successfully");
    Ok(pool)
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("Failed to enable foreign keys")?;

    let migrations = [
        include_str!("../../migrations/001_settings.sql"),
        include_str!("../../migrations/002_identity.sql"),
        include_str!("../../migrations/003_nodes.sql"),
    ];

    for (i, migration) in migrations.iter().enumerate() {
        info!("Running migration {}", i + 1);
        conn.execute_batch(migration)
            .with_context(|| format!("Failed to run migration {}", i + 1))?;
    }

    Ok(())
}

/// Helper for async database operations (spawn_blocking wrapper)
pub async fn execute_async<F, T>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().context("Failed to get database connection")?;
        f(&conn)
    })
    .await
    .context("Task join error")?
}
