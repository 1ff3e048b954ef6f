#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use mnemo::config::MnemoConfig;
use mnemo::db;
use mnemo::embedding::Embedder;
use mnemo::engine::MemoryEngine;
use mnemo::llm::{ExtractedMemory, LanguageModel, Structurize};
use mnemo::llm::xml::StructuredMemory;
use mnemo::memory::types::MemoryType;

pub const DIM: usize = 1024;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database(DIM).unwrap()
}

/// Deterministic unit vector with a spike at position `seed`.
pub fn spike(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[seed % DIM] = 1.0;
    v
}

/// Deterministic bag-of-words embedder: each token hashes to one dimension,
/// so texts sharing words embed close together. No model, no network.
pub struct HashEmbedder;

fn token_dim(token: &str) -> usize {
    // FNV-1a over the lowercased token
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.to_lowercase().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % DIM as u64) as usize
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        v[token_dim(token)] += 1.0;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    } else {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embed(text))
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Embedder that is always down, for lexical-fallback paths.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedder host unreachable")
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Scripted language model.
#[derive(Default)]
pub struct StubLlm {
    /// When set, structurize rejects everything with this reason.
    pub reject: Option<String>,
    /// When true, merge fails (drives the concatenation fallback).
    pub fail_merge: bool,
    /// What extract returns.
    pub extracted: Vec<ExtractedMemory>,
}

#[async_trait]
impl LanguageModel for StubLlm {
    async fn structurize(&self, text: &str, memory_type: MemoryType) -> Result<Structurize> {
        if let Some(reason) = &self.reject {
            return Ok(Structurize::Rejected {
                reason: reason.clone(),
            });
        }
        let xml = StructuredMemory {
            memory_type,
            domain: "general".into(),
            what: text.to_string(),
            when: None,
            action: None,
            warn: None,
        }
        .render();
        Ok(Structurize::Structured(xml))
    }

    async fn merge(&self, memories: &[String], domain: &str) -> Result<String> {
        if self.fail_merge {
            anyhow::bail!("LLM service unreachable");
        }
        // Union the inputs into <when> the way the real merge prompt does, so
        // the aggregate stays findable by member vocabulary.
        Ok(format!(
            "<memory type=\"pattern\" domain=\"{domain}\"><what>merged {} notes</what><when>{}</when></memory>",
            memories.len(),
            memories.join("|")
        ))
    }

    async fn extract(&self, _transcript: &str) -> Result<Vec<ExtractedMemory>> {
        Ok(self.extracted.clone())
    }

    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Config for tests: defaults, with the scratch dir pointed at a temp path
/// so pid files never land in the real home directory.
pub fn test_config() -> MnemoConfig {
    let mut config = MnemoConfig::default();
    config.storage.scratch_dir = std::env::temp_dir()
        .join(format!("mnemo-test-{}", std::process::id()))
        .to_string_lossy()
        .into_owned();
    config
}

/// Wire an engine over an in-memory database with the given gateways.
/// Returns the shared connection so tests can inspect raw rows.
pub fn engine_with(
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
) -> (MemoryEngine, Arc<Mutex<Connection>>) {
    let conn = Arc::new(Mutex::new(test_db()));
    let engine = MemoryEngine::new(
        Arc::clone(&conn),
        embedder,
        llm,
        Arc::new(test_config()),
    );
    (engine, conn)
}

/// The default test engine: hashing embedder + permissive stub LLM.
pub fn test_engine() -> (MemoryEngine, Arc<Mutex<Connection>>) {
    engine_with(Arc::new(HashEmbedder), Arc::new(StubLlm::default()))
}
