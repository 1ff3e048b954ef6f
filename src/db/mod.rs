//! Database lifecycle — opening `memory.db`, wiring the sqlite-vec
//! extension, and health reporting.
//!
//! The handle returned by [`open_database`] is the process-lifetime
//! connection the engine keeps behind its mutex; the vector index width is
//! fixed at open time and must match what the embedder host produces.

pub mod migrations;
pub mod schema;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register sqlite-vec as an auto-extension so every subsequently opened
/// connection can create and query vec0 tables. Idempotent.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open `memory.db` at `path`, creating it (and its directory) on first use.
///
/// `dimensions` is the vector index width; 1024 is required for databases
/// shared with existing deployments. The schema is initialized, pending
/// migrations run, and a quick integrity probe gates the handle before the
/// engine gets it.
pub fn open_database(path: impl AsRef<Path>, dimensions: usize) -> Result<Connection> {
    let path = path.as_ref();

    load_sqlite_vec();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open memory database at {}", path.display()))?;
    configure_pragmas(&conn)?;

    schema::init_schema(&conn, dimensions).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    verify_integrity(&conn)?;

    tracing::info!(path = %path.display(), dimensions, "memory database ready");
    Ok(conn)
}

/// Connection pragmas for the single-writer model: WAL keeps readers
/// unblocked while the engine holds the write side, foreign keys guard the
/// record-to-cluster reference, and the busy timeout rides out short lock
/// handoffs from hook child processes.
fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    Ok(())
}

/// Cheap corruption probe run at open; a damaged file is refused outright
/// rather than surfacing as scattered query failures later.
fn verify_integrity(conn: &Connection) -> Result<()> {
    let verdict: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if verdict != "ok" {
        bail!("memory database failed its integrity check: {verdict}");
    }
    Ok(())
}

/// Result of a full database health check.
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub sqlite_vec_version: String,
    pub memory_count: i64,
    pub cluster_count: i64,
}

/// The thorough variant of the open-time probe, for `mnemo doctor`: runs
/// the full `integrity_check` and collects version and row-count facts.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;
    let embedding_model =
        migrations::get_embedding_model(conn).context("failed to read embedding model")?;

    let integrity_details: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;

    let sqlite_vec_version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .context("failed to get sqlite-vec version")?;

    let memory_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap_or(0);
    let cluster_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM clusters", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(HealthReport {
        schema_version,
        embedding_model,
        integrity_ok: integrity_details == "ok",
        integrity_details,
        sqlite_vec_version,
        memory_count,
        cluster_count,
    })
}

/// In-memory database for tests: same schema and migrations, no file, no
/// WAL (meaningless without a file).
pub fn open_memory_database(dimensions: usize) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, dimensions).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}
