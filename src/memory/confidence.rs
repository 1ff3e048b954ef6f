//! Confidence and usage bookkeeping.
//!
//! Validation feedback moves confidence up (+0.1) or down (−0.05) inside the
//! `[0.3, 0.9]` band and bumps the evidence counter; usage tracking stamps
//! `last_accessed_at` and increments `access_count`.

use anyhow::{bail, Result};
use rusqlite::{params, Connection};

use crate::memory::store::{update_fields, RecordPatch};
use crate::memory::types::{clamp_confidence, MAX_CONFIDENCE};

/// Confidence delta for a positive validation event.
const VALIDATE_UP: f64 = 0.1;
/// Confidence delta for a negative validation event.
const VALIDATE_DOWN: f64 = -0.05;

/// Apply a validation event. Returns the new confidence.
pub fn validate(conn: &Connection, id: i64, is_valid: bool) -> Result<f64> {
    let current: f64 = match conn.query_row(
        "SELECT confidence FROM memories WHERE id = ?1",
        params![id],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(rusqlite::Error::QueryReturnedNoRows) => bail!("memory not found: {id}"),
        Err(e) => return Err(e.into()),
    };

    let delta = if is_valid { VALIDATE_UP } else { VALIDATE_DOWN };
    let updated = clamp_confidence(current + delta);

    update_fields(
        conn,
        id,
        &RecordPatch {
            confidence: Some(updated),
            evidence_delta: 1,
            ..Default::default()
        },
    )?;

    Ok(updated)
}

/// Stamp the given records as used: `access_count += 1`, `last_accessed_at = now`.
pub fn mark_used(conn: &Connection, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1, \
         updated_at = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

/// Raise confidence by `delta` (capped at 0.9) and mark the record used.
pub fn auto_boost(conn: &Connection, id: i64, delta: f64) -> Result<f64> {
    let current: f64 = match conn.query_row(
        "SELECT confidence FROM memories WHERE id = ?1",
        params![id],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(rusqlite::Error::QueryReturnedNoRows) => bail!("memory not found: {id}"),
        Err(e) => return Err(e.into()),
    };

    let updated = (current + delta).min(MAX_CONFIDENCE);
    update_fields(
        conn,
        id,
        &RecordPatch {
            confidence: Some(updated),
            access_delta: 1,
            last_accessed_at: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        },
    )?;
    Ok(updated)
}
