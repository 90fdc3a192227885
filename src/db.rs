use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "sqlite context established"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

/// Fresh in-memory database with the full schema, shared behind a mutex.
pub fn open_in_memory() -> AppResult<Arc<Mutex<Connection>>> {
    let connection = Connection::open_in_memory()?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&connection)?;
    Ok(Arc::new(Mutex::new(connection)))
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            region TEXT NOT NULL DEFAULT '',
            postal_code TEXT NOT NULL DEFAULT '',
            latitude REAL,
            longitude REAL,
            geocoded_address TEXT,
            suspicious INTEGER NOT NULL DEFAULT 0 CHECK (suspicious IN (0, 1)),
            geocoded_at TEXT,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS geocode_cache (
            cache_key TEXT PRIMARY KEY,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            suspicious INTEGER NOT NULL DEFAULT 0 CHECK (suspicious IN (0, 1)),
            canonical_address TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_flags (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL CHECK (value IN (0, 1)),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_geocode_cache_expires ON geocode_cache(expires_at);
        "#,
    )?;

    ensure_column(connection, "properties", "geocode_attempted_at TEXT")?;
    ensure_column(connection, "properties", "geocode_failure TEXT")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_properties_backlog
        ON properties(latitude, geocode_attempted_at, id)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('properties','geocode_cache','app_flags')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 3);
        assert!(ctx.path.ends_with("test.db"));
        assert!(column_exists(&ctx.connection, "properties", "geocode_failure").unwrap());
    }

    #[test]
    fn migrations_are_idempotent_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let ctx = bootstrap(dir.path(), "reopen.db").unwrap();
            ctx.connection
                .execute("INSERT INTO properties (address) VALUES ('1 Main St')", [])
                .unwrap();
        }
        let ctx = bootstrap(dir.path(), "reopen.db").unwrap();
        let count: i64 = ctx
            .connection
            .query_row("SELECT COUNT(*) FROM properties", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn in_memory_database_has_schema() {
        let db = open_in_memory().unwrap();
        let conn = db.lock();
        assert!(column_exists(&conn, "geocode_cache", "expires_at").unwrap());
        assert!(column_exists(&conn, "properties", "geocode_attempted_at").unwrap());
    }
}
