//! Core memory type definitions.
//!
//! Defines [`MemoryType`] (the ten record categories), [`ClusterStatus`],
//! [`MemoryRecord`] (a full row of the `memories` table), [`Cluster`], and the
//! per-type time-decay table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Confidence is kept inside this band on every mutation.
pub const MIN_CONFIDENCE: f64 = 0.3;
pub const MAX_CONFIDENCE: f64 = 0.9;

/// Clamp a confidence value into the allowed band.
pub fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Record categories. Behavior that varies by type (structuring field subset,
/// decay parameters) is table-driven, not subclassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Decision,
    Bug,
    Pattern,
    Context,
    Preference,
    Skill,
    Session,
    Learned,
    Permanent,
}

impl MemoryType {
    pub const ALL: [MemoryType; 10] = [
        Self::Fact,
        Self::Decision,
        Self::Bug,
        Self::Pattern,
        Self::Context,
        Self::Preference,
        Self::Skill,
        Self::Session,
        Self::Learned,
        Self::Permanent,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Bug => "bug",
            Self::Pattern => "pattern",
            Self::Context => "context",
            Self::Preference => "preference",
            Self::Skill => "skill",
            Self::Session => "session",
            Self::Learned => "learned",
            Self::Permanent => "permanent",
        }
    }

    /// Decay parameters `(half_life_days, min_weight)`. `None` half-life means
    /// the type never decays. Types outside the table use `context` values.
    pub fn decay_params(&self) -> (Option<f64>, f64) {
        match self {
            Self::Fact | Self::Decision => (Some(90.0), 0.3),
            Self::Bug => (Some(60.0), 0.3),
            Self::Pattern | Self::Learned => (Some(90.0), 0.4),
            Self::Preference => (Some(60.0), 0.2),
            Self::Context => (Some(30.0), 0.2),
            Self::Session => (Some(14.0), 0.1),
            Self::Skill | Self::Permanent => (None, 1.0),
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized enum tags read from SQL or wire input.
#[derive(Debug, Clone)]
pub struct ParseTagError {
    kind: &'static str,
    value: String,
}

impl ParseTagError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for ParseTagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseTagError {}

impl std::str::FromStr for MemoryType {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "decision" => Ok(Self::Decision),
            "bug" => Ok(Self::Bug),
            "pattern" => Ok(Self::Pattern),
            "context" => Ok(Self::Context),
            "preference" => Ok(Self::Preference),
            "skill" => Ok(Self::Skill),
            "session" => Ok(Self::Session),
            "learned" => Ok(Self::Learned),
            "permanent" => Ok(Self::Permanent),
            _ => Err(ParseTagError::new("memory type", s)),
        }
    }
}

/// Multiplicative rank weight for a record of the given age.
///
/// `weight = max(min_weight, 0.5 ^ (age_days / half_life_days))`; types with
/// no half-life always weigh 1.0.
pub fn decay_weight(created_at: &str, memory_type: MemoryType, now: DateTime<Utc>) -> f64 {
    let (half_life, min_weight) = memory_type.decay_params();
    let Some(half_life) = half_life else {
        return 1.0;
    };

    let created = match DateTime::parse_from_rfc3339(created_at) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => return 1.0,
    };

    let age_days = (now - created).num_seconds().max(0) as f64 / 86_400.0;
    let weight = 0.5_f64.powf(age_days / half_life);
    weight.max(min_weight)
}

/// Cluster lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Accepting members, below the maturity bar.
    Growing,
    /// Size and average confidence passed the maturity bar; eligible for merge.
    Mature,
    /// Collapsed into one aggregate record; owns no members.
    Merged,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Growing => "growing",
            Self::Mature => "mature",
            Self::Merged => "merged",
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClusterStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "growing" => Ok(Self::Growing),
            "mature" => Ok(Self::Mature),
            "merged" => Ok(Self::Merged),
            _ => Err(ParseTagError::new("cluster status", s)),
        }
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Monotonic integer primary key.
    pub id: i64,
    /// Original text as saved.
    pub content: String,
    /// Typed XML form, absent when structuring was skipped.
    pub structured: Option<String>,
    /// Leading prefix of `content`, at most 100 characters.
    pub summary: String,
    /// Comma-joined top content tokens by frequency.
    pub keywords: String,
    /// Comma-joined caller-supplied tags.
    pub tags: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub domain: String,
    /// Belief that the record is useful, in `[0.3, 0.9]`.
    pub confidence: f64,
    /// Validation events applied, monotonic.
    pub evidence_count: i64,
    pub access_count: i64,
    pub last_accessed_at: Option<String>,
    pub cluster_id: Option<i64>,
    /// Provenance tag (`user`, `mcp-tool`, `compact-analyzer`, `cluster-merge`).
    pub source: String,
    pub created_at: String,
    pub updated_at: String,
    pub promoted_at: Option<String>,
}

/// A cluster row.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: i64,
    /// Short token string describing the cluster, e.g. `retry-backoff-jitter`.
    pub theme: String,
    /// Arithmetic-mean member vector at creation time; drifts between rebuilds.
    pub centroid: Vec<f32>,
    pub member_count: i64,
    pub avg_confidence: f64,
    pub domain: String,
    pub status: ClusterStatus,
    pub created_at: String,
    pub updated_at: String,
    pub evolved_at: Option<String>,
}
