//! Remote embedder — line-delimited JSON client for the model host process.
//!
//! One request per connection: write `{"action":"embed","text":…}` as a
//! single line, read a single `{"success":…,"embedding":[…]}` line back. The
//! whole exchange runs under a deadline; expiry surfaces as an error that
//! callers treat as "no vector".

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::Embedder;
use crate::config::EmbeddingConfig;

pub struct RemoteEmbedder {
    addr: String,
    dimensions: usize,
    embed_timeout: Duration,
    query_timeout: Duration,
}

#[derive(Deserialize)]
struct EmbedReply {
    success: bool,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    error: Option<String>,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            addr: format!("127.0.0.1:{}", config.host_port),
            dimensions: config.dimensions,
            embed_timeout: Duration::from_millis(config.embed_timeout_ms),
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        }
    }

    async fn request(&self, text: &str, deadline: Duration) -> Result<Vec<f32>> {
        let exchange = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("embedder host unreachable at {}", self.addr))?;
            let (read_half, mut write_half) = stream.into_split();

            let request = serde_json::json!({ "action": "embed", "text": text });
            let mut line = serde_json::to_string(&request)?;
            line.push('\n');
            write_half.write_all(line.as_bytes()).await?;
            write_half.flush().await?;

            let mut reply_line = String::new();
            let mut reader = BufReader::new(read_half);
            reader.read_line(&mut reply_line).await?;

            let reply: EmbedReply =
                serde_json::from_str(reply_line.trim()).context("malformed embedder reply")?;
            if !reply.success {
                bail!(
                    "embedder error: {}",
                    reply.error.unwrap_or_else(|| "unknown".into())
                );
            }
            if reply.embedding.len() != self.dimensions {
                bail!(
                    "embedder returned {} dimensions, expected {}",
                    reply.embedding.len(),
                    self.dimensions
                );
            }
            Ok(reply.embedding)
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => bail!("embedder timed out after {}ms", deadline.as_millis()),
        }
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text, self.embed_timeout).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text, self.query_timeout).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
