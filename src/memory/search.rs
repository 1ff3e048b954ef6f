//! Hybrid retriever — lexical BM25 seed, dense-vector overlay, filters, and
//! weighted rank merge.
//!
//! The retriever itself is synchronous and takes an already-computed query
//! embedding; obtaining one (with its deadline) is the engine's job. Passing
//! `None` yields the lexical-only "quick" mode with zero model load.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;

use crate::memory::store;
use crate::memory::types::{decay_weight, MemoryRecord, MemoryType};

/// Weight of the dense similarity in the combined score.
const VECTOR_WEIGHT: f64 = 0.7;
/// Weight of the normalized BM25 score in the combined score.
const LEXICAL_WEIGHT: f64 = 0.3;
/// BM25 scores are squashed by `min(score / BM25_NORM, 1)`.
const BM25_NORM: f64 = 10.0;

/// Filters applied after the two retrieval paths merge.
#[derive(Debug, Default, Clone)]
pub struct SearchFilters {
    pub min_confidence: Option<f64>,
    pub memory_type: Option<MemoryType>,
    pub domain: Option<String>,
    /// Multiply the combined score by the per-type time-decay weight.
    pub decay: bool,
    /// Opt-in floor for candidates reachable only through the dense path.
    /// Unset, weak dense matches rank naturally by their combined score.
    /// Records seeded by the lexical path keep their similarity regardless.
    pub min_vector_similarity: Option<f64>,
}

/// One ranked search result in the wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedMemory {
    pub id: i64,
    /// Structured XML when present, else the raw content.
    pub content: String,
    pub raw_content: String,
    pub structured_content: Option<String>,
    pub summary: String,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub domain: String,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub created_at: String,
    /// `created_at` truncated to the calendar date.
    pub date: String,
    pub bm25_score: f64,
    pub vector_similarity: f64,
    pub vector_distance: f64,
    pub combined_score: f64,
}

struct Candidate {
    record: MemoryRecord,
    bm25: f64,
    vec_sim: f64,
    vec_dist: f64,
}

/// Hybrid search. `query_vec = None` degrades to lexical-only ranking.
pub fn search(
    conn: &Connection,
    query: &str,
    query_vec: Option<&[f32]>,
    k: usize,
    filters: &SearchFilters,
    cjk_stopwords: &HashSet<&str>,
) -> Result<Vec<RetrievedMemory>> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let candidate_limit = k * 2;

    // 1. Lexical seed
    let lexical = store::full_text_search(conn, query, candidate_limit, cjk_stopwords)?;
    let mut candidates: HashMap<i64, Candidate> = HashMap::new();
    for (id, bm25) in lexical {
        if let Some(record) = store::get_record(conn, id)? {
            candidates.insert(
                id,
                Candidate {
                    record,
                    bm25,
                    vec_sim: 0.0,
                    vec_dist: 2.0,
                },
            );
        }
    }

    // 2. Dense overlay
    if let Some(vec) = query_vec {
        for (id, distance) in store::vector_search(conn, vec, candidate_limit)? {
            let similarity = 1.0 - distance;
            if let Some(candidate) = candidates.get_mut(&id) {
                candidate.vec_sim = similarity;
                candidate.vec_dist = distance;
            } else if filters.min_vector_similarity.map_or(true, |floor| similarity >= floor) {
                if let Some(record) = store::get_record(conn, id)? {
                    candidates.insert(
                        id,
                        Candidate {
                            record,
                            bm25: 0.0,
                            vec_sim: similarity,
                            vec_dist: distance,
                        },
                    );
                }
            }
        }
    }

    // 3. Filters
    let now = Utc::now();
    let hybrid = query_vec.is_some();
    let mut results: Vec<RetrievedMemory> = candidates
        .into_values()
        .filter(|c| passes_filters(&c.record, filters))
        .map(|c| score_candidate(c, hybrid, filters.decay, now))
        .collect();

    // 4. Rank
    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    results.truncate(k);
    Ok(results)
}

fn passes_filters(record: &MemoryRecord, filters: &SearchFilters) -> bool {
    if let Some(min) = filters.min_confidence {
        if record.confidence < min {
            return false;
        }
    }
    if let Some(memory_type) = filters.memory_type {
        if record.memory_type != memory_type {
            return false;
        }
    }
    if let Some(ref domain) = filters.domain {
        if &record.domain != domain {
            return false;
        }
    }
    true
}

fn score_candidate(
    candidate: Candidate,
    hybrid: bool,
    decay: bool,
    now: DateTime<Utc>,
) -> RetrievedMemory {
    let record = candidate.record;
    let bm25_norm = (candidate.bm25 / BM25_NORM).min(1.0);

    // Quick mode ranks by raw BM25 so lexical order survives the absence of
    // any vector signal.
    let mut combined = if hybrid {
        VECTOR_WEIGHT * candidate.vec_sim + LEXICAL_WEIGHT * bm25_norm
    } else {
        candidate.bm25
    };
    if decay {
        combined *= decay_weight(&record.created_at, record.memory_type, now);
    }

    let date = record.created_at.chars().take(10).collect();
    let tags = if record.tags.is_empty() {
        Vec::new()
    } else {
        record.tags.split(',').map(|t| t.trim().to_string()).collect()
    };

    RetrievedMemory {
        id: record.id,
        content: record
            .structured
            .clone()
            .unwrap_or_else(|| record.content.clone()),
        raw_content: record.content,
        structured_content: record.structured,
        summary: record.summary,
        memory_type: record.memory_type.as_str().to_string(),
        domain: record.domain,
        confidence: record.confidence,
        tags,
        created_at: record.created_at,
        date,
        bm25_score: candidate.bm25,
        vector_similarity: candidate.vec_sim,
        vector_distance: candidate.vec_dist,
        combined_score: combined,
    }
}
