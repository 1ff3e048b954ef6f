use anyhow::Result;

use crate::config::MnemoConfig;
use crate::engine::MemoryEngine;
use crate::memory::search::SearchFilters;

/// Run a search from the terminal. `quick` skips the embedder entirely.
pub async fn search(
    config: MnemoConfig,
    query: &str,
    limit: Option<usize>,
    quick: bool,
    domain: Option<String>,
) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let limit = limit.unwrap_or(engine.config().search.max_results);
    let filters = SearchFilters {
        domain,
        ..Default::default()
    };

    let results = if quick {
        engine.quick_search(query, limit, filters).await?
    } else {
        engine.memory_search(query, limit, filters).await?
    };

    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", results.len());
    for (i, result) in results.iter().enumerate() {
        let preview = if result.raw_content.chars().count() > 120 {
            let prefix: String = result.raw_content.chars().take(120).collect();
            format!("{prefix}...")
        } else {
            result.raw_content.clone()
        };

        println!(
            "  {}. [{}/{}] #{} (confidence: {:.2}, score: {:.4})",
            i + 1,
            result.memory_type,
            result.domain,
            result.id,
            result.confidence,
            result.combined_score,
        );
        println!("     {preview}");
        println!();
    }

    Ok(())
}
