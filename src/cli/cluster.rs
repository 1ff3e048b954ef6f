use anyhow::Result;

use crate::config::MnemoConfig;
use crate::engine::MemoryEngine;
use crate::memory::cluster::AutoClusterOptions;

/// Run a batch clustering pass over the unclustered backlog.
pub async fn auto(
    config: MnemoConfig,
    domain: Option<String>,
    min_confidence: f64,
    min_size: usize,
    hours_back: Option<f64>,
) -> Result<()> {
    let threshold = config.cluster.similarity_threshold;
    let engine = MemoryEngine::open(config)?;
    let report = engine
        .auto_cluster(AutoClusterOptions {
            domain,
            min_confidence,
            min_size,
            threshold,
            hours_back,
        })
        .await?;

    println!(
        "Created {} cluster(s) covering {} memorie(s).",
        report.clusters_created, report.memories_clustered
    );
    Ok(())
}

/// Merge one mature cluster into an aggregate record.
pub async fn merge(config: MnemoConfig, cluster_id: i64) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let outcome = engine.merge_cluster(cluster_id).await?;

    println!(
        "Cluster {} merged into memory #{} ({} member(s){}).",
        outcome.cluster_id,
        outcome.new_memory_id,
        outcome.merged_members,
        if outcome.used_fallback {
            ", concatenation fallback"
        } else {
            ""
        }
    );
    Ok(())
}
