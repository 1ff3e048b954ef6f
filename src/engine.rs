//! The engine facade — shared state plus the four tool operations consumed
//! by an external request router (`memory_search`, `memory_save`,
//! `memory_validate`, `memory_stats`), the quick lexical search, and the
//! curator's batch procedures.
//!
//! Holds the process-lifetime database handle and the two gateway clients.
//! Synchronous storage work is bridged onto the blocking pool; the gateways
//! are the only awaited suspension points.

use anyhow::Result;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::MnemoConfig;
use crate::db;
use crate::embedding::{self, Embedder};
use crate::llm::{self, LanguageModel};
use crate::memory::cluster::{
    self, AutoClusterOptions, AutoClusterReport, MergeOutcome,
};
use crate::memory::save::{self, SaveOutcome, SaveRequest};
use crate::memory::search::{self, RetrievedMemory, SearchFilters};
use crate::memory::stats::{self, StatsResponse};
use crate::memory::{confidence, text};

#[derive(Clone)]
pub struct MemoryEngine {
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    config: Arc<MnemoConfig>,
}

impl MemoryEngine {
    /// Wire an engine from existing parts (used by tests with stub gateways).
    pub fn new(
        db: Arc<Mutex<Connection>>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        config: Arc<MnemoConfig>,
    ) -> Self {
        Self {
            db,
            embedder,
            llm,
            config,
        }
    }

    /// Open the configured database and connect the remote gateways.
    pub fn open(config: MnemoConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path, config.embedding.dimensions)?;
        tracing::info!(db = %db_path.display(), "database ready");

        if let Ok(Some(stored_model)) = db::migrations::get_embedding_model(&conn) {
            if stored_model != config.embedding.model {
                tracing::warn!(
                    stored = %stored_model,
                    configured = %config.embedding.model,
                    "embedding model changed — existing vectors were built with the stored model"
                );
            }
        }

        let embedder = embedding::create_embedder(&config.embedding);
        let llm = llm::create_language_model(&config.llm);

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            embedder,
            llm,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &MnemoConfig {
        &self.config
    }

    /// Hybrid search. Falls back to lexical-only when the embedder is
    /// unavailable; returned records are marked used.
    pub async fn memory_search(
        &self,
        query: &str,
        limit: usize,
        filters: SearchFilters,
    ) -> Result<Vec<RetrievedMemory>> {
        let query_vec = match self.embedder.embed_query(query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "query embedding unavailable, lexical-only search");
                None
            }
        };
        self.run_search(query, limit, filters, query_vec).await
    }

    /// Lexical-only search with zero model load.
    pub async fn quick_search(
        &self,
        query: &str,
        limit: usize,
        filters: SearchFilters,
    ) -> Result<Vec<RetrievedMemory>> {
        self.run_search(query, limit, filters, None).await
    }

    async fn run_search(
        &self,
        query: &str,
        limit: usize,
        filters: SearchFilters,
        query_vec: Option<Vec<f32>>,
    ) -> Result<Vec<RetrievedMemory>> {
        let db = Arc::clone(&self.db);
        let query = query.to_string();
        let cjk_stopwords = self.config.stopwords.cjk.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<RetrievedMemory>> {
            let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let stop_set = text::stopword_set(&cjk_stopwords);
            let results = search::search(
                &conn,
                &query,
                query_vec.as_deref(),
                limit,
                &filters,
                &stop_set,
            )?;
            let ids: Vec<i64> = results.iter().map(|r| r.id).collect();
            confidence::mark_used(&conn, &ids)?;
            Ok(results)
        })
        .await?
    }

    /// Save a memory through the full pipeline.
    pub async fn memory_save(&self, request: SaveRequest) -> Result<SaveOutcome> {
        save::save(
            Arc::clone(&self.db),
            Arc::clone(&self.embedder),
            Arc::clone(&self.llm),
            Arc::clone(&self.config),
            request,
        )
        .await
    }

    /// Apply a validation event; returns the new confidence.
    pub async fn memory_validate(&self, id: i64, is_valid: bool) -> Result<f64> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<f64> {
            let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            confidence::validate(&conn, id, is_valid)
        })
        .await?
    }

    /// Totals by type/domain, cluster counts by status, promoted count.
    pub async fn memory_stats(&self) -> Result<StatsResponse> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<StatsResponse> {
            let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            stats::memory_stats(&conn)
        })
        .await?
    }

    /// Mark records used without searching.
    pub async fn mark_used(&self, ids: Vec<i64>) -> Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            confidence::mark_used(&conn, &ids)
        })
        .await?
    }

    /// Raise a record's confidence and mark it used.
    pub async fn auto_boost(&self, id: i64, delta: f64) -> Result<f64> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<f64> {
            let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            confidence::auto_boost(&conn, id, delta)
        })
        .await?
    }

    /// Batch-cluster the unclustered backlog.
    pub async fn auto_cluster(&self, options: AutoClusterOptions) -> Result<AutoClusterReport> {
        let db = Arc::clone(&self.db);
        let cluster_config = self.config.cluster.clone();
        let mut stopwords = self.config.stopwords.english.clone();
        stopwords.extend(self.config.stopwords.cjk.iter().cloned());

        tokio::task::spawn_blocking(move || -> Result<AutoClusterReport> {
            let mut conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let stop_set = text::stopword_set(&stopwords);
            cluster::auto_cluster(&mut conn, &options, &cluster_config, &stop_set)
        })
        .await?
    }

    /// Collapse a mature cluster into one aggregate record.
    pub async fn merge_cluster(&self, cluster_id: i64) -> Result<MergeOutcome> {
        cluster::merge_cluster(
            Arc::clone(&self.db),
            Arc::clone(&self.embedder),
            Arc::clone(&self.llm),
            Arc::clone(&self.config),
            cluster_id,
        )
        .await
    }

    /// Extract records from a session transcript and save each one.
    pub async fn ingest_transcript(&self, transcript: &str) -> Result<Vec<SaveOutcome>> {
        let extracted = self.llm.extract(transcript).await?;
        let mut outcomes = Vec::with_capacity(extracted.len());
        for candidate in extracted {
            let outcome = self
                .memory_save(SaveRequest {
                    content: candidate.summary,
                    memory_type: candidate.memory_type,
                    domain: candidate.domain,
                    confidence: candidate.confidence,
                    source: "compact-analyzer".into(),
                    pre_structured: Some(candidate.structured),
                    ..Default::default()
                })
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
