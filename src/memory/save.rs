//! The write path — dedup gate, structuring, insert, embedding, cluster join.
//!
//! [`save`] is the single entry point. Database work runs on the blocking
//! pool under the shared connection lock; the structurer and embedder are the
//! only awaited suspension points and both degrade on failure (save proceeds
//! unstructured and/or vectorless) rather than retrying.

use anyhow::{bail, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::MnemoConfig;
use crate::embedding::{build_embedding_input, try_embed, Embedder};
use crate::llm::{LanguageModel, Structurize};
use crate::memory::cluster::{try_join_cluster, JoinOutcome};
use crate::memory::store::{self, NewMemory, RecordPatch};
use crate::memory::text;
use crate::memory::types::{clamp_confidence, MemoryType, MAX_CONFIDENCE};

/// Dedup looks at this many recent records per `(type, domain)` bucket.
const DEDUP_WINDOW: usize = 10;
/// Word-level Jaccard similarity at or above this is a duplicate.
const DEDUP_THRESHOLD: f64 = 0.95;
/// Confidence boost applied to the surviving record on a dedup hit.
const DEDUP_BOOST: f64 = 0.05;

/// Parameters for a save call.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub content: String,
    pub memory_type: MemoryType,
    pub domain: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub source: String,
    /// Leave `structured` empty instead of calling the structurer.
    pub skip_structurize: bool,
    /// Already-structured XML supplied by the caller (e.g. transcript
    /// extraction); skips the structurer.
    pub pre_structured: Option<String>,
    /// Skip the online cluster join even when a vector was stored.
    pub suppress_clustering: bool,
}

impl Default for SaveRequest {
    fn default() -> Self {
        Self {
            content: String::new(),
            memory_type: MemoryType::Context,
            domain: "general".into(),
            tags: Vec::new(),
            confidence: 0.5,
            source: "user".into(),
            skip_structurize: false,
            pre_structured: None,
            suppress_clustering: false,
        }
    }
}

/// Outcome of a save. `Updated` and `Rejected` are normal results, not errors.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SaveOutcome {
    #[serde(rename = "created")]
    Created {
        id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cluster: Option<JoinOutcome>,
    },
    #[serde(rename = "updated")]
    Updated { id: i64, similarity: f64 },
    #[serde(rename = "rejected")]
    Rejected { reason: String },
}

/// Run the full save pipeline.
pub async fn save(
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    config: Arc<MnemoConfig>,
    request: SaveRequest,
) -> Result<SaveOutcome> {
    if request.content.trim().is_empty() {
        bail!("content must not be empty");
    }
    let request = SaveRequest {
        domain: request.domain.to_lowercase(),
        ..request
    };

    // 1. Dedup gate against the recent bucket
    let dedup_hit = {
        let db = Arc::clone(&db);
        let request = request.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<(i64, f64)>> {
            let mut conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let tx = conn.transaction()?;
            let hit = dedup_check(&tx, &request.content, request.memory_type, &request.domain)?;
            if let Some((id, _)) = hit {
                reinforce_duplicate(&tx, id)?;
            }
            tx.commit()?;
            Ok(hit)
        })
        .await??
    };
    if let Some((id, similarity)) = dedup_hit {
        info!(id, similarity, "duplicate save reinforced");
        return Ok(SaveOutcome::Updated { id, similarity });
    }

    // 2. Structured form: caller-supplied, skipped, or from the structurer
    let structured = if let Some(pre) = request.pre_structured.clone() {
        Some(pre)
    } else if request.skip_structurize {
        None
    } else {
        match llm.structurize(&request.content, request.memory_type).await {
            Ok(Structurize::Structured(xml)) => Some(xml),
            Ok(Structurize::Rejected { reason }) => {
                info!(reason = %reason, "structurer rejected content");
                return Ok(SaveOutcome::Rejected { reason });
            }
            Err(e) => {
                warn!(error = %e, "structurer unavailable, saving unstructured");
                None
            }
        }
    };

    // 3. Insert the record
    let id = {
        let db = Arc::clone(&db);
        let request = request.clone();
        let structured = structured.clone();
        let stopwords = config.stopwords.english.clone();
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let mut conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let tx = conn.transaction()?;
            let stop_set = text::stopword_set(&stopwords);
            let id = store::insert_record(
                &tx,
                &NewMemory {
                    content: &request.content,
                    structured: structured.as_deref(),
                    summary: &text::summarize(&request.content),
                    keywords: &text::extract_keywords(&request.content, &stop_set),
                    tags: &request.tags.join(","),
                    memory_type: request.memory_type,
                    domain: &request.domain,
                    confidence: clamp_confidence(request.confidence),
                    source: &request.source,
                    promoted_at: None,
                },
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await??
    };

    // 4. Embed and index
    let embed_body = structured.as_deref().unwrap_or(&request.content);
    let embed_input = build_embedding_input(embed_body, &request.domain);
    let embedding =
        try_embed(embedder.as_ref(), &embed_input, config.embedding.dimensions).await;

    // 5. Vector insert + online cluster join
    let cluster = if let Some(vector) = embedding {
        let db = Arc::clone(&db);
        let request = request.clone();
        let cluster_config = config.cluster.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<JoinOutcome>> {
            let mut conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let tx = conn.transaction()?;
            store::insert_vector(&tx, id, &vector)?;
            let join = if request.suppress_clustering {
                None
            } else {
                try_join_cluster(
                    &tx,
                    id,
                    &vector,
                    &request.domain,
                    clamp_confidence(request.confidence),
                    &cluster_config,
                )?
            };
            tx.commit()?;
            Ok(join)
        })
        .await??
    } else {
        None
    };

    info!(
        id,
        memory_type = %request.memory_type,
        domain = %request.domain,
        clustered = cluster.is_some(),
        "memory created"
    );
    Ok(SaveOutcome::Created { id, cluster })
}

/// Compare against the most recent records in the same `(type, domain)`
/// bucket. Returns the best hit at or above the threshold.
pub fn dedup_check(
    conn: &Connection,
    content: &str,
    memory_type: MemoryType,
    domain: &str,
) -> Result<Option<(i64, f64)>> {
    let recent = store::recent_by_type_domain(conn, memory_type, domain, DEDUP_WINDOW)?;
    let mut best: Option<(i64, f64)> = None;
    for record in recent {
        let similarity = text::jaccard_similarity(content, &record.content);
        if similarity >= DEDUP_THRESHOLD && best.map_or(true, |(_, s)| similarity > s) {
            best = Some((record.id, similarity));
        }
    }
    Ok(best)
}

/// A duplicate save counts as reinforcement: bump usage and confidence.
fn reinforce_duplicate(conn: &Connection, id: i64) -> Result<()> {
    let current: f64 = conn.query_row(
        "SELECT confidence FROM memories WHERE id = ?1",
        rusqlite::params![id],
        |row| row.get(0),
    )?;
    store::update_fields(
        conn,
        id,
        &RecordPatch {
            confidence: Some((current + DEDUP_BOOST).min(MAX_CONFIDENCE)),
            access_delta: 1,
            last_accessed_at: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        },
    )?;
    Ok(())
}
