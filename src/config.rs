use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MnemoConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub cluster: ClusterConfig,
    pub llm: LlmConfig,
    pub stopwords: StopwordConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Loopback port for the line-delimited JSON protocol.
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub log_dir: String,
    /// Where pid files are written while the server runs.
    pub scratch_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    /// Vector width. Must be 1024 for `memory.db` compatibility.
    pub dimensions: usize,
    /// Loopback port of the embedding model host process.
    pub host_port: u16,
    pub embed_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub max_results: usize,
    pub min_similarity: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    pub similarity_threshold: f64,
    /// Members required before a cluster can mature.
    pub maturity_count: usize,
    /// Average member confidence required before a cluster can mature.
    pub maturity_confidence: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// Loopback port of the LLM service process.
    pub port: u16,
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
    pub timeout_ms: u64,
    pub structurize_timeout_ms: u64,
    pub merge_timeout_ms: u64,
    pub session_timeout_ms: u64,
}

/// Stopword sets are data, not code: both lists can be replaced wholesale
/// from the config file for other languages.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StopwordConfig {
    pub english: Vec<String>,
    pub cjk: Vec<String>,
}

impl Default for MnemoConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            cluster: ClusterConfig::default(),
            llm: LlmConfig::default(),
            stopwords: StopwordConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 23811,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = default_mnemo_dir();
        Self {
            data_dir: base.to_string_lossy().into_owned(),
            log_dir: base.join("logs").to_string_lossy().into_owned(),
            scratch_dir: base.join("run").to_string_lossy().into_owned(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "multilingual-e5-large".into(),
            dimensions: 1024,
            host_port: 23812,
            embed_timeout_ms: 800,
            query_timeout_ms: 1000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 3,
            min_similarity: 0.6,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.70,
            maturity_count: 5,
            maturity_confidence: 0.65,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            port: 23813,
            endpoint: String::new(),
            api_key: String::new(),
            deployment: String::new(),
            api_version: String::new(),
            timeout_ms: 5_000,
            structurize_timeout_ms: 15_000,
            merge_timeout_ms: 20_000,
            session_timeout_ms: 30_000,
        }
    }
}

const DEFAULT_ENGLISH_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from",
    "has", "have", "if", "in", "into", "is", "it", "its", "no", "not", "of",
    "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "were", "will", "with", "you", "your",
];

const DEFAULT_CJK_STOPWORDS: &[&str] = &[
    "的", "了", "是", "在", "我", "有", "和", "就", "不", "人", "都", "一",
    "上", "也", "很", "到", "说", "要", "去", "你", "会", "着", "没有", "这",
    "那", "一个", "我们", "什么",
];

impl Default for StopwordConfig {
    fn default() -> Self {
        Self {
            english: DEFAULT_ENGLISH_STOPWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cjk: DEFAULT_CJK_STOPWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Returns `~/.mnemo/`
pub fn default_mnemo_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnemo")
}

/// Returns the default config file path: `~/.mnemo/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnemo_dir().join("config.toml")
}

impl MnemoConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemoConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MNEMO_DATA_DIR, MNEMO_PORT, MNEMO_LLM_PORT, MNEMO_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMO_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("MNEMO_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = std::env::var("MNEMO_LLM_PORT") {
            if let Ok(port) = val.parse() {
                self.llm.port = port;
            }
        }
        if let Ok(val) = std::env::var("MNEMO_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Resolve the database path (`memory.db` inside the data directory).
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir).join("memory.db")
    }

    /// Resolve the pid file path inside the scratch directory.
    pub fn pid_file_path(&self) -> PathBuf {
        expand_tilde(&self.storage.scratch_dir).join("mnemo.pid")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MnemoConfig::default();
        assert_eq!(config.server.port, 23811);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.embedding.embed_timeout_ms, 800);
        assert_eq!(config.search.max_results, 3);
        assert!((config.cluster.similarity_threshold - 0.70).abs() < 1e-9);
        assert_eq!(config.cluster.maturity_count, 5);
        assert!(config.resolved_db_path().ends_with("memory.db"));
        assert!(!config.stopwords.english.is_empty());
        assert!(!config.stopwords.cjk.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
port = 24900
log_level = "debug"

[storage]
data_dir = "/tmp/mnemo-test"

[cluster]
similarity_threshold = 0.8
"#;
        let config: MnemoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 24900);
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.data_dir, "/tmp/mnemo-test");
        assert!((config.cluster.similarity_threshold - 0.8).abs() < 1e-9);
        // defaults still apply for unset fields
        assert_eq!(config.cluster.maturity_count, 5);
        assert_eq!(config.embedding.dimensions, 1024);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MnemoConfig::default();
        std::env::set_var("MNEMO_DATA_DIR", "/tmp/override");
        std::env::set_var("MNEMO_PORT", "25000");
        std::env::set_var("MNEMO_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.data_dir, "/tmp/override");
        assert_eq!(config.server.port, 25000);
        assert_eq!(config.server.log_level, "trace");

        // Clean up
        std::env::remove_var("MNEMO_DATA_DIR");
        std::env::remove_var("MNEMO_PORT");
        std::env::remove_var("MNEMO_LOG_LEVEL");
    }
}
