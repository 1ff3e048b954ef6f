use anyhow::Result;

use crate::config::MnemoConfig;
use crate::engine::MemoryEngine;

/// Print store statistics as pretty JSON.
pub async fn stats(config: MnemoConfig) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let stats = engine.memory_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
