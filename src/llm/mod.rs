pub mod remote;
pub mod xml;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::memory::types::MemoryType;

/// Outcome of a structurize call: either a typed XML record, or a verdict
/// that the content is not worth persisting (one-off command, temporary
/// request, session-local noise).
#[derive(Debug, Clone, PartialEq)]
pub enum Structurize {
    Structured(String),
    Rejected { reason: String },
}

/// A candidate record extracted from a session transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedMemory {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub domain: String,
    pub confidence: f64,
    pub summary: String,
    #[serde(rename = "structuredContent")]
    pub structured: String,
}

/// Trait for the structuring/merging language-model backend.
///
/// All methods carry per-call deadlines in the production implementation;
/// callers fall back on failure (save proceeds unstructured, merge
/// concatenates) rather than retrying.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Convert free text into a typed XML record, or reject it.
    async fn structurize(&self, text: &str, memory_type: MemoryType) -> Result<Structurize>;

    /// Merge several structured records into one aggregate XML record.
    async fn merge(&self, memories: &[String], domain: &str) -> Result<String>;

    /// Extract up to three records worth persisting from a transcript.
    async fn extract(&self, transcript: &str) -> Result<Vec<ExtractedMemory>>;

    /// Liveness probe.
    async fn ping(&self) -> Result<bool>;
}

/// Create the production language-model client from config.
pub fn create_language_model(
    config: &crate::config::LlmConfig,
) -> std::sync::Arc<dyn LanguageModel> {
    std::sync::Arc::new(remote::RemoteLanguageModel::new(config))
}
