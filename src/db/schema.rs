//! SQL DDL for all mnemo tables.
//!
//! Defines the `memories` table, the `memories_fts` (FTS5) inverted index with
//! its synchronization triggers, the `memories_vec` (vec0) vector index, the
//! `clusters` table, and `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Cluster table first: memories.cluster_id references it
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    theme TEXT NOT NULL,
    centroid BLOB NOT NULL,
    member_count INTEGER NOT NULL DEFAULT 0,
    avg_confidence REAL NOT NULL DEFAULT 0.0,
    domain TEXT NOT NULL DEFAULT 'general',
    status TEXT NOT NULL DEFAULT 'growing' CHECK(status IN ('growing','mature','merged')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    evolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_clusters_domain_status ON clusters(domain, status);

-- Core memory storage
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL CHECK(length(content) > 0),
    structured TEXT,
    summary TEXT NOT NULL DEFAULT '',
    keywords TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '',
    type TEXT NOT NULL DEFAULT 'context' CHECK(type IN
        ('fact','decision','bug','pattern','context','preference','skill','session','learned','permanent')),
    domain TEXT NOT NULL DEFAULT 'general',
    confidence REAL NOT NULL DEFAULT 0.5 CHECK(confidence >= 0.3 AND confidence <= 0.9),
    evidence_count INTEGER NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    cluster_id INTEGER REFERENCES clusters(id),
    source TEXT NOT NULL DEFAULT 'user',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    promoted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_type_domain ON memories(type, domain);
CREATE INDEX IF NOT EXISTS idx_memories_domain ON memories(domain);
CREATE INDEX IF NOT EXISTS idx_memories_cluster ON memories(cluster_id);
CREATE INDEX IF NOT EXISTS idx_memories_confidence ON memories(confidence);

-- Full-text search (BM25) over all indexed text fields
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    structured,
    summary,
    tags,
    keywords,
    content='memories',
    content_rowid='id'
);

-- Triggers keep the FTS index consistent with the memories table.
-- Nullable columns are coalesced so delete entries match what was indexed.
CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content, structured, summary, tags, keywords)
    VALUES (new.id, new.content, coalesce(new.structured, ''), new.summary, new.tags, new.keywords);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content, structured, summary, tags, keywords)
    VALUES ('delete', old.id, old.content, coalesce(old.structured, ''), old.summary, old.tags, old.keywords);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content, structured, summary, tags, keywords)
    VALUES ('delete', old.id, old.content, coalesce(old.structured, ''), old.summary, old.tags, old.keywords);
    INSERT INTO memories_fts(rowid, content, structured, summary, tags, keywords)
    VALUES (new.id, new.content, coalesce(new.structured, ''), new.summary, new.tags, new.keywords);
END;

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
/// The vector entry for memory `n` lives at rowid `n`.
fn vec_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(\n\
         \x20   embedding FLOAT[{dimensions}] distance_metric=cosine\n\
         );"
    )
}

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&vec_table_sql(dimensions))?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1024).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"memories".to_string()));
        assert!(tables.contains(&"clusters".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));

        // Verify the vec extension is live
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1024).unwrap();
        init_schema(&conn, 1024).unwrap(); // second call should not error
    }

    #[test]
    fn fts_triggers_track_inserts_and_deletes() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1024).unwrap();

        conn.execute(
            "INSERT INTO memories (content, summary, keywords, created_at, updated_at) \
             VALUES ('the quantum compiler', 'the quantum compiler', 'quantum,compiler', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'quantum'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM memories", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'quantum'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn fts_trigger_reindexes_on_update() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1024).unwrap();

        conn.execute(
            "INSERT INTO memories (content, summary, created_at, updated_at) \
             VALUES ('original text', 'original text', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute("UPDATE memories SET content = 'replacement text'", [])
            .unwrap();

        let old_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'original'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(old_hits, 0);

        let new_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'replacement'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(new_hits, 1);
    }
}
