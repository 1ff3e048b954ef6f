pub mod remote;

use anyhow::Result;
use async_trait::async_trait;

/// Vector width required for `memory.db` compatibility.
pub const EMBEDDING_DIM: usize = 1024;

/// Trait for obtaining text embeddings.
///
/// Implementations return L2-normalized vectors of the configured width. The
/// engine never loads a model itself — the production implementation talks to
/// a long-lived model host over a loopback socket with a hard deadline.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text for storage.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a search query. Same contract as [`Self::embed`] with a slightly
    /// longer deadline; the default just delegates.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text).await
    }

    /// Vector width this embedder produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Build the canonical embedding input for a record.
///
/// Non-general domains are prefixed so the same sentence in different domains
/// embeds apart: `"[backend] <memory …>"`.
pub fn build_embedding_input(body: &str, domain: &str) -> String {
    if domain != "general" {
        format!("[{domain}] {body}")
    } else {
        body.to_string()
    }
}

/// Create the production embedder from config.
pub fn create_embedder(config: &crate::config::EmbeddingConfig) -> std::sync::Arc<dyn Embedder> {
    std::sync::Arc::new(remote::RemoteEmbedder::new(config))
}

/// Embed, degrading any failure (including a wrong-width reply) to `None`
/// with a warning. Callers proceed without a vector; there is no retry at
/// this level.
pub async fn try_embed(
    embedder: &dyn Embedder,
    text: &str,
    dimensions: usize,
) -> Option<Vec<f32>> {
    match embedder.embed(text).await {
        Ok(vector) if vector.len() == dimensions => Some(vector),
        Ok(vector) => {
            tracing::warn!(
                got = vector.len(),
                want = dimensions,
                "embedding has wrong width, continuing without vector"
            );
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedding unavailable, continuing without vector");
            None
        }
    }
}
