//! Loopback serving surface — line-delimited JSON over TCP.
//!
//! Actions: `search`, `quickSearch`, `ping`, `stats`, `shutdown`. One JSON
//! object per line in, one per line out; errors reply
//! `{"success":false,"error":…}` and keep the connection open. A pid file
//! lives in the scratch directory for the lifetime of the server.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{expand_tilde, MnemoConfig};
use crate::engine::MemoryEngine;
use crate::memory::search::SearchFilters;
use crate::memory::types::MemoryType;

#[derive(Debug, Deserialize)]
struct Request {
    action: String,
    #[serde(default)]
    query: String,
    limit: Option<usize>,
    #[serde(default)]
    options: RequestOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestOptions {
    #[serde(rename = "type")]
    memory_type: Option<String>,
    domain: Option<String>,
    min_confidence: Option<f64>,
    /// Opt-in floor for dense-only candidates.
    min_similarity: Option<f64>,
    #[serde(default)]
    decay: bool,
}

/// Start the server on the configured loopback port and run until a
/// `shutdown` request arrives.
pub async fn serve(config: MnemoConfig) -> Result<()> {
    let engine = MemoryEngine::open(config.clone())?;
    let addr = format!("127.0.0.1:{}", config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "memory server listening");
    serve_on(engine, listener).await
}

/// Accept loop over an already-bound listener (tests bind port 0).
pub async fn serve_on(engine: MemoryEngine, listener: TcpListener) -> Result<()> {
    let pid_file = write_pid_file(engine.config())?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "client connected");
                        let engine = engine.clone();
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(handle_connection(engine, stream, shutdown_tx));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    if let Some(pid_file) = pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    info!("memory server shut down");
    Ok(())
}

fn write_pid_file(config: &MnemoConfig) -> Result<Option<PathBuf>> {
    let scratch_dir = expand_tilde(&config.storage.scratch_dir);
    if let Err(e) = std::fs::create_dir_all(&scratch_dir) {
        warn!(error = %e, "cannot create scratch dir, skipping pid file");
        return Ok(None);
    }
    let path = config.pid_file_path();
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    Ok(Some(path))
}

async fn handle_connection(
    engine: MemoryEngine,
    stream: TcpStream,
    shutdown_tx: watch::Sender<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let (reply, shutdown) = dispatch(&engine, &line).await;
        let mut payload = reply.to_string();
        payload.push('\n');
        if write_half.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
        if shutdown {
            let _ = write_half.flush().await;
            let _ = shutdown_tx.send(true);
            break;
        }
    }
}

/// Handle one request line. Returns the reply and whether to shut down.
async fn dispatch(engine: &MemoryEngine, line: &str) -> (Value, bool) {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return (error_reply(&format!("malformed request: {e}")), false),
    };

    match request.action.as_str() {
        "ping" => (json!({ "success": true, "ready": true }), false),
        "shutdown" => (json!({ "success": true }), true),
        "stats" => match engine.memory_stats().await {
            Ok(stats) => (json!({ "success": true, "stats": stats }), false),
            Err(e) => (error_reply(&e.to_string()), false),
        },
        "search" | "quickSearch" => {
            let filters = match build_filters(&request.options) {
                Ok(filters) => filters,
                Err(e) => return (error_reply(&e), false),
            };
            let limit = request
                .limit
                .unwrap_or(engine.config().search.max_results);
            let result = if request.action == "search" {
                engine.memory_search(&request.query, limit, filters).await
            } else {
                engine.quick_search(&request.query, limit, filters).await
            };
            match result {
                Ok(results) => (json!({ "success": true, "results": results }), false),
                Err(e) => (error_reply(&e.to_string()), false),
            }
        }
        other => (error_reply(&format!("unknown action: {other}")), false),
    }
}

fn build_filters(options: &RequestOptions) -> Result<SearchFilters, String> {
    let memory_type = match &options.memory_type {
        Some(value) => Some(value.parse::<MemoryType>().map_err(|e| e.to_string())?),
        None => None,
    };
    Ok(SearchFilters {
        min_confidence: options.min_confidence,
        memory_type,
        domain: options.domain.clone(),
        decay: options.decay,
        min_vector_similarity: options.min_similarity,
    })
}

fn error_reply(message: &str) -> Value {
    json!({ "success": false, "error": message })
}
