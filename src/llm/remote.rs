//! Remote language-model client — line-delimited JSON over TCP loopback.
//!
//! Actions used by the engine: `structurize`, `merge`, `analyzeSession`, and
//! `ping`. Each action carries its own deadline from config.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{ExtractedMemory, LanguageModel, Structurize};
use crate::config::LlmConfig;
use crate::memory::types::MemoryType;

/// A transcript yields at most this many extracted records.
const MAX_EXTRACTED: usize = 3;

pub struct RemoteLanguageModel {
    addr: String,
    default_timeout: Duration,
    structurize_timeout: Duration,
    merge_timeout: Duration,
    session_timeout: Duration,
}

impl RemoteLanguageModel {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            addr: format!("127.0.0.1:{}", config.port),
            default_timeout: Duration::from_millis(config.timeout_ms),
            structurize_timeout: Duration::from_millis(config.structurize_timeout_ms),
            merge_timeout: Duration::from_millis(config.merge_timeout_ms),
            session_timeout: Duration::from_millis(config.session_timeout_ms),
        }
    }

    /// One request per connection: a single JSON line out, a single line back.
    async fn request(&self, payload: Value, deadline: Duration) -> Result<Value> {
        let exchange = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("LLM service unreachable at {}", self.addr))?;
            let (read_half, mut write_half) = stream.into_split();

            let mut line = serde_json::to_string(&payload)?;
            line.push('\n');
            write_half.write_all(line.as_bytes()).await?;
            write_half.flush().await?;

            let mut reply_line = String::new();
            let mut reader = BufReader::new(read_half);
            reader.read_line(&mut reply_line).await?;

            let reply: Value =
                serde_json::from_str(reply_line.trim()).context("malformed LLM reply")?;
            if reply.get("success").and_then(Value::as_bool) == Some(false) {
                let error = reply
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                bail!("LLM service error: {error}");
            }
            Ok(reply)
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => bail!("LLM call timed out after {}ms", deadline.as_millis()),
        }
    }
}

#[async_trait]
impl LanguageModel for RemoteLanguageModel {
    async fn structurize(&self, text: &str, memory_type: MemoryType) -> Result<Structurize> {
        let reply = self
            .request(
                json!({ "action": "structurize", "text": text, "type": memory_type.as_str() }),
                self.structurize_timeout,
            )
            .await?;

        match reply.get("structured") {
            Some(Value::String(xml)) => {
                super::xml::parse(xml).context("structurizer returned invalid XML")?;
                Ok(Structurize::Structured(xml.clone()))
            }
            Some(Value::Object(obj)) if obj.get("__rejected") == Some(&Value::Bool(true)) => {
                let reason = obj
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("low value")
                    .to_string();
                Ok(Structurize::Rejected { reason })
            }
            _ => bail!("structurize reply missing 'structured'"),
        }
    }

    async fn merge(&self, memories: &[String], domain: &str) -> Result<String> {
        let reply = self
            .request(
                json!({ "action": "merge", "memories": memories, "domain": domain }),
                self.merge_timeout,
            )
            .await?;

        match reply.get("merged") {
            Some(Value::String(xml)) => Ok(xml.clone()),
            _ => bail!("merge reply missing 'merged'"),
        }
    }

    async fn extract(&self, transcript: &str) -> Result<Vec<ExtractedMemory>> {
        let reply = self
            .request(
                json!({ "action": "analyzeSession", "transcript": transcript }),
                self.session_timeout,
            )
            .await?;

        let Some(memories) = reply.get("memories") else {
            bail!("analyzeSession reply missing 'memories'");
        };
        let mut extracted: Vec<ExtractedMemory> =
            serde_json::from_value(memories.clone()).context("malformed extracted memories")?;
        extracted.truncate(MAX_EXTRACTED);
        Ok(extracted)
    }

    async fn ping(&self) -> Result<bool> {
        let reply = self
            .request(json!({ "action": "ping" }), self.default_timeout)
            .await?;
        Ok(reply.get("success").and_then(Value::as_bool) == Some(true))
    }
}
