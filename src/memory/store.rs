//! Durable record layer — transactional primitives over the `memories`,
//! `memories_vec`, and `clusters` tables.
//!
//! The FTS index follows the `memories` table through triggers, so the write
//! primitives here never touch it directly. Every public mutation is expected
//! to run inside a single transaction at the caller's boundary; primitives
//! take `&Connection` so they compose under `rusqlite::Transaction`.

use anyhow::{bail, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};

use crate::memory::text;
use crate::memory::types::{clamp_confidence, Cluster, ClusterStatus, MemoryRecord, MemoryType};

/// Score attached to a record matched only by whole-query substring fallback.
const FALLBACK_MATCH_SCORE: f64 = 0.3;

/// Score contributed by each matched CJK n-gram.
const CJK_NGRAM_SCORE: f64 = 0.5;

const RECORD_COLS: &str = "id, content, structured, summary, keywords, tags, type, domain, \
     confidence, evidence_count, access_count, last_accessed_at, cluster_id, source, \
     created_at, updated_at, promoted_at";

// ── Vector encoding ───────────────────────────────────────────────────────────

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Decode a sqlite-vec blob back into an f32 vector.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ── Record primitives ─────────────────────────────────────────────────────────

/// Fields for a new record. `summary` and `keywords` are computed by the
/// caller so the same values flow into the FTS index via the insert trigger.
pub struct NewMemory<'a> {
    pub content: &'a str,
    pub structured: Option<&'a str>,
    pub summary: &'a str,
    pub keywords: &'a str,
    pub tags: &'a str,
    pub memory_type: MemoryType,
    pub domain: &'a str,
    pub confidence: f64,
    pub source: &'a str,
    pub promoted_at: Option<&'a str>,
}

/// Insert a new memory row. Returns the new record id.
pub fn insert_record(conn: &Connection, memory: &NewMemory<'_>) -> Result<i64> {
    if memory.content.is_empty() {
        bail!("content must not be empty");
    }
    let now = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO memories (content, structured, summary, keywords, tags, type, domain, \
         confidence, source, created_at, updated_at, promoted_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
        params![
            memory.content,
            memory.structured,
            memory.summary,
            memory.keywords,
            memory.tags,
            memory.memory_type.as_str(),
            memory.domain,
            clamp_confidence(memory.confidence),
            memory.source,
            now,
            memory.promoted_at,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Fetch a single record by id.
pub fn get_record(conn: &Connection, id: i64) -> Result<Option<MemoryRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLS} FROM memories WHERE id = ?1"),
            params![id],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

/// Partial update of mutable record fields. Unset fields are left untouched;
/// a confidence write is clamped to the allowed band.
#[derive(Debug, Default)]
pub struct RecordPatch {
    pub confidence: Option<f64>,
    pub evidence_delta: i64,
    pub access_delta: i64,
    pub last_accessed_at: Option<String>,
    /// `Some(None)` clears the cluster assignment.
    pub cluster_id: Option<Option<i64>>,
    pub promoted_at: Option<String>,
}

/// Apply a [`RecordPatch`]. `updated_at` is always refreshed.
pub fn update_fields(conn: &Connection, id: i64, patch: &RecordPatch) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut sets: Vec<String> = vec!["updated_at = ?1".into()];
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now)];

    if let Some(confidence) = patch.confidence {
        values.push(Box::new(clamp_confidence(confidence)));
        sets.push(format!("confidence = ?{}", values.len()));
    }
    if patch.evidence_delta != 0 {
        values.push(Box::new(patch.evidence_delta));
        sets.push(format!("evidence_count = evidence_count + ?{}", values.len()));
    }
    if patch.access_delta != 0 {
        values.push(Box::new(patch.access_delta));
        sets.push(format!("access_count = access_count + ?{}", values.len()));
    }
    if let Some(ref accessed) = patch.last_accessed_at {
        values.push(Box::new(accessed.clone()));
        sets.push(format!("last_accessed_at = ?{}", values.len()));
    }
    if let Some(cluster_id) = patch.cluster_id {
        values.push(Box::new(cluster_id));
        sets.push(format!("cluster_id = ?{}", values.len()));
    }
    if let Some(ref promoted) = patch.promoted_at {
        values.push(Box::new(promoted.clone()));
        sets.push(format!("promoted_at = ?{}", values.len()));
    }

    values.push(Box::new(id));
    let sql = format!(
        "UPDATE memories SET {} WHERE id = ?{}",
        sets.join(", "),
        values.len()
    );

    let affected = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
    if affected == 0 {
        bail!("memory not found: {id}");
    }
    Ok(())
}

/// Delete a record and its vector entry. The FTS entry follows via trigger.
pub fn delete_record(conn: &Connection, id: i64) -> Result<()> {
    delete_vector(conn, id)?;
    let affected = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    if affected == 0 {
        bail!("memory not found: {id}");
    }
    Ok(())
}

// ── Vector primitives ─────────────────────────────────────────────────────────

/// Insert the vector entry for record `id` at rowid `id`. The record must
/// already exist — a vector without a record is an integrity failure.
pub fn insert_vector(conn: &Connection, id: i64, embedding: &[f32]) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if !exists {
        bail!("vector insert for missing record: {id}");
    }
    conn.execute(
        "INSERT INTO memories_vec (rowid, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

/// Remove the vector entry for record `id`, if present.
pub fn delete_vector(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM memories_vec WHERE rowid = ?1", params![id])?;
    Ok(())
}

/// Fetch the stored vector for record `id`.
pub fn vector_by_id(conn: &Connection, id: i64) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM memories_vec WHERE rowid = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob.map(|b| bytes_to_embedding(&b)))
}

// ── Cluster primitives ────────────────────────────────────────────────────────

pub struct NewCluster<'a> {
    pub theme: &'a str,
    pub centroid: &'a [f32],
    pub member_count: i64,
    pub avg_confidence: f64,
    pub domain: &'a str,
    pub status: ClusterStatus,
}

pub fn insert_cluster(conn: &Connection, cluster: &NewCluster<'_>) -> Result<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO clusters (theme, centroid, member_count, avg_confidence, domain, status, \
         created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            cluster.theme,
            embedding_to_bytes(cluster.centroid),
            cluster.member_count,
            cluster.avg_confidence,
            cluster.domain,
            cluster.status.as_str(),
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Default)]
pub struct ClusterPatch {
    pub member_count: Option<i64>,
    pub avg_confidence: Option<f64>,
    pub status: Option<ClusterStatus>,
    pub evolved_at: Option<String>,
}

pub fn update_cluster(conn: &Connection, id: i64, patch: &ClusterPatch) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut sets: Vec<String> = vec!["updated_at = ?1".into()];
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now)];

    if let Some(count) = patch.member_count {
        values.push(Box::new(count));
        sets.push(format!("member_count = ?{}", values.len()));
    }
    if let Some(avg) = patch.avg_confidence {
        values.push(Box::new(avg));
        sets.push(format!("avg_confidence = ?{}", values.len()));
    }
    if let Some(status) = patch.status {
        values.push(Box::new(status.as_str()));
        sets.push(format!("status = ?{}", values.len()));
    }
    if let Some(ref evolved) = patch.evolved_at {
        values.push(Box::new(evolved.clone()));
        sets.push(format!("evolved_at = ?{}", values.len()));
    }

    values.push(Box::new(id));
    let sql = format!(
        "UPDATE clusters SET {} WHERE id = ?{}",
        sets.join(", "),
        values.len()
    );

    let affected = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
    if affected == 0 {
        bail!("cluster not found: {id}");
    }
    Ok(())
}

pub fn get_cluster(conn: &Connection, id: i64) -> Result<Option<Cluster>> {
    let cluster = conn
        .query_row(
            "SELECT id, theme, centroid, member_count, avg_confidence, domain, status, \
             created_at, updated_at, evolved_at FROM clusters WHERE id = ?1",
            params![id],
            row_to_cluster,
        )
        .optional()?;
    Ok(cluster)
}

/// All growing or mature clusters in a domain, ordered by id (the online join
/// breaks similarity ties toward the earliest cluster).
pub fn clusters_by_domain(conn: &Connection, domain: &str) -> Result<Vec<Cluster>> {
    let mut stmt = conn.prepare(
        "SELECT id, theme, centroid, member_count, avg_confidence, domain, status, \
         created_at, updated_at, evolved_at FROM clusters \
         WHERE domain = ?1 AND status IN ('growing', 'mature') ORDER BY id",
    )?;
    let clusters = stmt
        .query_map(params![domain], row_to_cluster)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clusters)
}

/// Members of a cluster, ordered by id.
pub fn cluster_members(conn: &Connection, cluster_id: i64) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLS} FROM memories WHERE cluster_id = ?1 ORDER BY id"
    ))?;
    let members = stmt
        .query_map(params![cluster_id], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

// ── Read helpers ──────────────────────────────────────────────────────────────

/// The most recent records in a `(type, domain)` bucket, newest first.
pub fn recent_by_type_domain(
    conn: &Connection,
    memory_type: MemoryType,
    domain: &str,
    limit: usize,
) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLS} FROM memories WHERE type = ?1 AND domain = ?2 \
         ORDER BY id DESC LIMIT ?3"
    ))?;
    let records = stmt
        .query_map(
            params![memory_type.as_str(), domain, limit as i64],
            row_to_record,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Unclustered records eligible for batch clustering, highest confidence
/// first. `hours_back` bounds `created_at` when set.
pub fn unclustered_memories(
    conn: &Connection,
    domain: Option<&str>,
    min_confidence: f64,
    hours_back: Option<f64>,
    limit: usize,
) -> Result<Vec<MemoryRecord>> {
    let cutoff = hours_back.map(|h| {
        (chrono::Utc::now() - chrono::Duration::seconds((h * 3600.0) as i64)).to_rfc3339()
    });

    let mut sql = format!(
        "SELECT {RECORD_COLS} FROM memories \
         WHERE cluster_id IS NULL AND confidence >= ?1"
    );
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(min_confidence)];

    if let Some(domain) = domain {
        values.push(Box::new(domain.to_string()));
        sql.push_str(&format!(" AND domain = ?{}", values.len()));
    }
    if let Some(cutoff) = cutoff {
        values.push(Box::new(cutoff));
        sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
    }

    values.push(Box::new(limit as i64));
    sql.push_str(&format!(" ORDER BY confidence DESC, id LIMIT ?{}", values.len()));

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(rusqlite::params_from_iter(values.iter()), row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

// ── Search primitives ─────────────────────────────────────────────────────────

/// BM25 full-text search with mixed-script query handling.
///
/// ASCII word tokens become a disjunctive phrase query against the FTS index.
/// CJK runs expand into stopword-filtered bigrams and trigrams, each matched
/// by substring against `content` and `structured` (score 0.5 per matched
/// n-gram). If neither path hits, a whole-query substring match scores 0.3.
/// Paths merge by id keeping the maximum score.
pub fn full_text_search(
    conn: &Connection,
    query: &str,
    k: usize,
    cjk_stopwords: &HashSet<&str>,
) -> Result<Vec<(i64, f64)>> {
    let query = query.trim();
    if query.is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let tokens = text::tokenize(query);
    let mut scores: HashMap<i64, f64> = HashMap::new();

    // Path 1: disjunctive phrase query over ASCII words
    if !tokens.words.is_empty() {
        let match_expr = tokens
            .words
            .iter()
            .map(|word| format!("\"{word}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut stmt = conn.prepare(
            "SELECT rowid, -rank FROM memories_fts WHERE memories_fts MATCH ?1 \
             ORDER BY rank LIMIT ?2",
        )?;
        let hits = stmt
            .query_map(params![match_expr, k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id, score) in hits {
            merge_score(&mut scores, id, score);
        }
    }

    // Path 2: CJK n-gram substring matching
    let mut seen_grams = HashSet::new();
    let mut grams: Vec<String> = Vec::new();
    for run in &tokens.cjk_runs {
        for gram in text::cjk_ngrams(run, cjk_stopwords) {
            if seen_grams.insert(gram.clone()) {
                grams.push(gram);
            }
        }
    }
    if !grams.is_empty() {
        let mut matched: HashMap<i64, usize> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT id FROM memories \
             WHERE instr(content, ?1) > 0 OR instr(coalesce(structured, ''), ?1) > 0",
        )?;
        for gram in &grams {
            let ids = stmt
                .query_map(params![gram], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for id in ids {
                *matched.entry(id).or_insert(0) += 1;
            }
        }
        for (id, count) in matched {
            merge_score(&mut scores, id, count as f64 * CJK_NGRAM_SCORE);
        }
    }

    // Fallback: whole-query substring match
    if scores.is_empty() {
        let mut stmt = conn.prepare(
            "SELECT id FROM memories WHERE instr(content, ?1) > 0 LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![query, k as i64], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for id in ids {
            merge_score(&mut scores, id, FALLBACK_MATCH_SCORE);
        }
    }

    let mut ranked: Vec<(i64, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    ranked.truncate(k);
    Ok(ranked)
}

fn merge_score(scores: &mut HashMap<i64, f64>, id: i64, score: f64) {
    let entry = scores.entry(id).or_insert(0.0);
    if score > *entry {
        *entry = score;
    }
}

/// Vector KNN search. Returns `(id, cosine_distance)` pairs, distance in [0, 2].
pub fn vector_search(conn: &Connection, embedding: &[f32], k: usize) -> Result<Vec<(i64, f64)>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT rowid, distance FROM memories_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_to_bytes(embedding), k as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let type_str: String = row.get(6)?;
    let memory_type = type_str
        .parse::<MemoryType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        content: row.get(1)?,
        structured: row.get(2)?,
        summary: row.get(3)?,
        keywords: row.get(4)?,
        tags: row.get(5)?,
        memory_type,
        domain: row.get(7)?,
        confidence: row.get(8)?,
        evidence_count: row.get(9)?,
        access_count: row.get(10)?,
        last_accessed_at: row.get(11)?,
        cluster_id: row.get(12)?,
        source: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        promoted_at: row.get(16)?,
    })
}

fn row_to_cluster(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    let status_str: String = row.get(6)?;
    let status = status_str
        .parse::<ClusterStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let centroid_blob: Vec<u8> = row.get(2)?;

    Ok(Cluster {
        id: row.get(0)?,
        theme: row.get(1)?,
        centroid: bytes_to_embedding(&centroid_blob),
        member_count: row.get(3)?,
        avg_confidence: row.get(4)?,
        domain: row.get(5)?,
        status,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        evolved_at: row.get(9)?,
    })
}
