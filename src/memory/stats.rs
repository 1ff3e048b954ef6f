use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// Store-wide statistics in the wire shape.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_memories: u64,
    pub by_type: HashMap<String, u64>,
    pub by_domain: HashMap<String, u64>,
    pub clusters_by_status: HashMap<String, u64>,
    /// Records carrying a promotion timestamp (merge-born aggregates).
    pub promoted: u64,
    pub vectors: u64,
}

/// Compute totals by type/domain, cluster counts by status, and the promoted
/// count.
pub fn memory_stats(conn: &Connection) -> Result<StatsResponse> {
    let total_memories: i64 =
        conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;

    let mut by_type = HashMap::new();
    for memory_type in crate::memory::types::MemoryType::ALL {
        by_type.insert(memory_type.as_str().to_string(), 0);
    }
    count_grouped(conn, "SELECT type, COUNT(*) FROM memories GROUP BY type", &mut by_type)?;

    let mut by_domain = HashMap::new();
    count_grouped(
        conn,
        "SELECT domain, COUNT(*) FROM memories GROUP BY domain",
        &mut by_domain,
    )?;

    let mut clusters_by_status = HashMap::new();
    for status in ["growing", "mature", "merged"] {
        clusters_by_status.insert(status.to_string(), 0);
    }
    count_grouped(
        conn,
        "SELECT status, COUNT(*) FROM clusters GROUP BY status",
        &mut clusters_by_status,
    )?;

    let promoted: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE promoted_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?;

    let vectors: i64 =
        conn.query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))?;

    Ok(StatsResponse {
        total_memories: total_memories as u64,
        by_type,
        by_domain,
        clusters_by_status,
        promoted: promoted as u64,
        vectors: vectors as u64,
    })
}

fn count_grouped(
    conn: &Connection,
    sql: &str,
    into: &mut HashMap<String, u64>,
) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (key, count) in rows {
        into.insert(key, count as u64);
    }
    Ok(())
}
