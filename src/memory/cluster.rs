//! Incremental clustering — online joins on save, batch clustering over the
//! unclustered backlog, and the merge that collapses a mature cluster into a
//! single aggregate record.
//!
//! The online join deliberately leaves the centroid untouched (accepted
//! drift); batch clustering recomputes exact arithmetic-mean centroids.

use anyhow::{bail, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::MnemoConfig;
use crate::embedding::{build_embedding_input, try_embed, Embedder};
use crate::llm::LanguageModel;
use crate::memory::store::{
    self, ClusterPatch, NewCluster, NewMemory, RecordPatch,
};
use crate::memory::text;
use crate::memory::types::{Cluster, ClusterStatus, MemoryRecord, MemoryType};

/// Batch clustering looks at no more than this many unclustered records.
const AUTO_CLUSTER_BATCH: usize = 100;

/// Confidence assigned to an LLM-merged aggregate record.
const MERGE_CONFIDENCE: f64 = 0.9;
/// Confidence assigned when the merge falls back to concatenation.
const MERGE_FALLBACK_CONFIDENCE: f64 = 0.85;

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Result of a successful online cluster join.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub cluster_id: i64,
    pub similarity: f64,
    pub matured: bool,
}

/// Try to attach a freshly embedded record to the best-matching cluster in
/// its domain. Ties on similarity resolve to the earliest cluster id. The
/// centroid is not re-averaged here; batch clustering rebuilds it.
pub fn try_join_cluster(
    conn: &Connection,
    record_id: i64,
    embedding: &[f32],
    domain: &str,
    confidence: f64,
    config: &crate::config::ClusterConfig,
) -> Result<Option<JoinOutcome>> {
    let clusters = store::clusters_by_domain(conn, domain)?;

    let mut best: Option<(&Cluster, f64)> = None;
    for cluster in &clusters {
        let similarity = cosine_similarity(embedding, &cluster.centroid);
        if similarity < config.similarity_threshold {
            continue;
        }
        // clusters arrive ordered by id, so strict > keeps the earliest on ties
        if best.map_or(true, |(_, s)| similarity > s) {
            best = Some((cluster, similarity));
        }
    }

    let Some((cluster, similarity)) = best else {
        return Ok(None);
    };
    let cluster_id = cluster.id;

    store::update_fields(
        conn,
        record_id,
        &RecordPatch {
            cluster_id: Some(Some(cluster_id)),
            ..Default::default()
        },
    )?;

    let new_count = cluster.member_count + 1;
    let new_avg =
        (cluster.avg_confidence * cluster.member_count as f64 + confidence) / new_count as f64;
    let matured = cluster.status == ClusterStatus::Growing
        && new_count >= config.maturity_count as i64
        && new_avg >= config.maturity_confidence;

    store::update_cluster(
        conn,
        cluster_id,
        &ClusterPatch {
            member_count: Some(new_count),
            avg_confidence: Some(new_avg),
            status: matured.then_some(ClusterStatus::Mature),
            ..Default::default()
        },
    )?;

    info!(
        record = record_id,
        cluster = cluster_id,
        similarity,
        matured,
        "joined cluster"
    );

    Ok(Some(JoinOutcome {
        cluster_id,
        similarity,
        matured,
    }))
}

/// Knobs for a batch clustering pass.
#[derive(Debug, Clone)]
pub struct AutoClusterOptions {
    pub domain: Option<String>,
    pub min_confidence: f64,
    pub min_size: usize,
    pub threshold: f64,
    pub hours_back: Option<f64>,
}

impl Default for AutoClusterOptions {
    fn default() -> Self {
        Self {
            domain: None,
            min_confidence: 0.5,
            min_size: 2,
            threshold: 0.70,
            hours_back: None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoClusterReport {
    pub clusters_created: usize,
    pub memories_clustered: usize,
}

/// Single-pass greedy batch clustering over the unclustered backlog.
///
/// Records without vectors cannot cluster and are skipped. Within each
/// domain, records are visited highest-confidence first; each unassigned
/// record seeds a candidate and absorbs later unassigned records whose
/// similarity to the seed clears the threshold.
pub fn auto_cluster(
    conn: &mut Connection,
    options: &AutoClusterOptions,
    config: &crate::config::ClusterConfig,
    theme_stopwords: &HashSet<&str>,
) -> Result<AutoClusterReport> {
    let tx = conn.transaction()?;
    let mut report = AutoClusterReport::default();

    let records = store::unclustered_memories(
        &tx,
        options.domain.as_deref(),
        options.min_confidence,
        options.hours_back,
        AUTO_CLUSTER_BATCH,
    )?;

    // Pair each candidate with its vector, preserving confidence order
    let mut by_domain: HashMap<String, Vec<(MemoryRecord, Vec<f32>)>> = HashMap::new();
    let mut domain_order: Vec<String> = Vec::new();
    for record in records {
        let Some(vector) = store::vector_by_id(&tx, record.id)? else {
            continue;
        };
        if !by_domain.contains_key(&record.domain) {
            domain_order.push(record.domain.clone());
        }
        by_domain
            .entry(record.domain.clone())
            .or_default()
            .push((record, vector));
    }

    for domain in domain_order {
        let group = &by_domain[&domain];
        let mut assigned = vec![false; group.len()];

        for seed_idx in 0..group.len() {
            if assigned[seed_idx] {
                continue;
            }
            let mut member_idxs = vec![seed_idx];
            for other_idx in (seed_idx + 1)..group.len() {
                if assigned[other_idx] {
                    continue;
                }
                let similarity =
                    cosine_similarity(&group[seed_idx].1, &group[other_idx].1);
                if similarity >= options.threshold {
                    member_idxs.push(other_idx);
                }
            }
            if member_idxs.len() < options.min_size {
                continue;
            }
            for &idx in &member_idxs {
                assigned[idx] = true;
            }

            let members: Vec<&(MemoryRecord, Vec<f32>)> =
                member_idxs.iter().map(|&i| &group[i]).collect();
            let centroid = mean_centroid(members.iter().map(|(_, v)| v.as_slice()));
            let avg_confidence = members.iter().map(|(m, _)| m.confidence).sum::<f64>()
                / members.len() as f64;
            let status = if members.len() >= config.maturity_count
                && avg_confidence >= config.maturity_confidence
            {
                ClusterStatus::Mature
            } else {
                ClusterStatus::Growing
            };
            let contents: Vec<&str> =
                members.iter().map(|(m, _)| m.content.as_str()).collect();
            let theme = infer_theme(&contents, theme_stopwords);

            let cluster_id = store::insert_cluster(
                &tx,
                &NewCluster {
                    theme: &theme,
                    centroid: &centroid,
                    member_count: members.len() as i64,
                    avg_confidence,
                    domain: &domain,
                    status,
                },
            )?;
            for (member, _) in &members {
                store::update_fields(
                    &tx,
                    member.id,
                    &RecordPatch {
                        cluster_id: Some(Some(cluster_id)),
                        ..Default::default()
                    },
                )?;
            }

            info!(
                cluster = cluster_id,
                domain = %domain,
                theme = %theme,
                size = members.len(),
                status = %status,
                "batch cluster created"
            );
            report.clusters_created += 1;
            report.memories_clustered += members.len();
        }
    }

    tx.commit()?;
    Ok(report)
}

/// Arithmetic-mean centroid of a set of vectors. Not re-normalized.
fn mean_centroid<'a>(vectors: impl Iterator<Item = &'a [f32]>) -> Vec<f32> {
    let mut sum: Vec<f32> = Vec::new();
    let mut count = 0usize;
    for vector in vectors {
        if sum.is_empty() {
            sum = vec![0.0; vector.len()];
        }
        for (acc, value) in sum.iter_mut().zip(vector.iter()) {
            *acc += value;
        }
        count += 1;
    }
    if count > 0 {
        for value in &mut sum {
            *value /= count as f32;
        }
    }
    sum
}

/// Theme = the three most frequent member tokens (stopwords and tokens of
/// length <= 2 dropped) joined with `-`; `general-pattern` when nothing
/// survives.
pub fn infer_theme(contents: &[&str], stopwords: &HashSet<&str>) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut position = 0usize;

    for content in contents {
        let tokens = text::tokenize(content);
        for token in tokens.words.iter().chain(tokens.cjk_runs.iter()) {
            position += 1;
            if token.chars().count() <= 2 || stopwords.contains(token.as_str()) {
                continue;
            }
            *counts.entry(token.clone()).or_insert(0) += 1;
            first_seen.entry(token.clone()).or_insert(position);
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by_key(|(token, count)| (std::cmp::Reverse(*count), first_seen[token]));

    let theme: Vec<String> = ranked.into_iter().take(3).map(|(token, _)| token).collect();
    if theme.is_empty() {
        "general-pattern".to_string()
    } else {
        theme.join("-")
    }
}

/// Result of a cluster merge.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub cluster_id: i64,
    pub new_memory_id: i64,
    pub merged_members: usize,
    pub used_fallback: bool,
}

/// Collapse a mature cluster into one aggregate record.
///
/// The aggregate (and its vector, when embedding succeeds) is inserted before
/// any member is deleted, so a reader never observes the cluster's knowledge
/// missing entirely. LLM failure degrades to concatenated member texts.
pub async fn merge_cluster(
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    config: Arc<MnemoConfig>,
    cluster_id: i64,
) -> Result<MergeOutcome> {
    // Phase 1: read and validate under the lock
    let (members, domain) = {
        let db = Arc::clone(&db);
        tokio::task::spawn_blocking(move || -> Result<(Vec<MemoryRecord>, String)> {
            let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let Some(cluster) = store::get_cluster(&conn, cluster_id)? else {
                bail!("cluster not found: {cluster_id}");
            };
            if cluster.status != ClusterStatus::Mature {
                bail!("cluster {cluster_id} is not mature (status: {})", cluster.status);
            }
            let members = store::cluster_members(&conn, cluster_id)?;
            if members.len() < 2 {
                bail!("cluster {cluster_id} has fewer than 2 members");
            }
            Ok((members, cluster.domain))
        })
        .await??
    };

    let texts: Vec<String> = members
        .iter()
        .map(|m| m.structured.clone().unwrap_or_else(|| m.content.clone()))
        .collect();
    let aggregate_type = mode_type(&members);

    // Phase 2: ask the LLM for a merged record, fall back to concatenation
    let (content, structured, confidence, used_fallback) =
        match llm.merge(&texts, &domain).await {
            Ok(xml) => (xml.clone(), Some(xml), MERGE_CONFIDENCE, false),
            Err(e) => {
                warn!(cluster = cluster_id, error = %e, "merge LLM failed, using concatenation");
                (texts.join("\n---\n"), None, MERGE_FALLBACK_CONFIDENCE, true)
            }
        };

    // Phase 3: embed the aggregate (optional)
    let embed_input = build_embedding_input(
        structured.as_deref().unwrap_or(&content),
        &domain,
    );
    let embedding =
        try_embed(embedder.as_ref(), &embed_input, config.embedding.dimensions).await;

    // Phase 4: swap aggregate in, members out
    let stopwords = config.stopwords.english.clone();
    let member_ids: Vec<i64> = members.iter().map(|m| m.id).collect();
    let new_id = tokio::task::spawn_blocking(move || -> Result<i64> {
        let mut conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        let tx = conn.transaction()?;

        let stop_set = text::stopword_set(&stopwords);
        let now = chrono::Utc::now().to_rfc3339();
        let new_id = store::insert_record(
            &tx,
            &NewMemory {
                content: &content,
                structured: structured.as_deref(),
                summary: &text::summarize(&content),
                keywords: &text::extract_keywords(&content, &stop_set),
                tags: "",
                memory_type: aggregate_type,
                domain: &domain,
                confidence,
                source: "cluster-merge",
                promoted_at: Some(now.as_str()),
            },
        )?;
        if let Some(ref vector) = embedding {
            store::insert_vector(&tx, new_id, vector)?;
        }

        for member_id in &member_ids {
            store::delete_record(&tx, *member_id)?;
        }
        store::update_cluster(
            &tx,
            cluster_id,
            &ClusterPatch {
                status: Some(ClusterStatus::Merged),
                evolved_at: Some(now),
                ..Default::default()
            },
        )?;

        tx.commit()?;
        Ok(new_id)
    })
    .await??;

    info!(
        cluster = cluster_id,
        new_memory = new_id,
        members = members.len(),
        used_fallback,
        "cluster merged"
    );

    Ok(MergeOutcome {
        cluster_id,
        new_memory_id: new_id,
        merged_members: members.len(),
        used_fallback,
    })
}

/// Most frequent member type; ties resolve to the earliest member.
fn mode_type(members: &[MemoryRecord]) -> MemoryType {
    let mut counts: HashMap<MemoryType, usize> = HashMap::new();
    let mut first_seen: HashMap<MemoryType, usize> = HashMap::new();
    for (position, member) in members.iter().enumerate() {
        *counts.entry(member.memory_type).or_insert(0) += 1;
        first_seen.entry(member.memory_type).or_insert(position);
    }
    counts
        .into_iter()
        .max_by_key(|(memory_type, count)| {
            (*count, std::cmp::Reverse(first_seen[memory_type]))
        })
        .map(|(memory_type, _)| memory_type)
        .unwrap_or(MemoryType::Context)
}
