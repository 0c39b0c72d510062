//! TOML configuration for the `traq` engine.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/traq.sqlite"
//!
//! [embedding]
//! backend = "pseudo"     # pseudo | local
//!
//! [assignment]
//! min_confidence = 0.5
//!
//! [detection.keywords]
//! traq = "Traq"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use traq_attribution_core::embedding::EMBEDDING_DIMS;
use traq_attribution_core::learner::LearningTables;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

impl Config {
    /// Defaults everywhere, with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            embedding: EmbeddingConfig::default(),
            assignment: AssignmentConfig::default(),
            backfill: BackfillConfig::default(),
            learning: LearningConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            dims: default_dims(),
            max_seq_len: default_max_seq_len(),
        }
    }
}

fn default_backend() -> String {
    "pseudo".to_string()
}
fn default_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_dims() -> usize {
    EMBEDDING_DIMS
}
fn default_max_seq_len() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssignmentConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_neighbors")]
    pub neighbors: usize,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            cache_ttl_secs: default_cache_ttl_secs(),
            neighbors: default_neighbors(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.5
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_neighbors() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackfillConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

/// Optional replacements for the built-in learning deny-lists.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LearningConfig {
    #[serde(default)]
    pub generic_apps: Option<Vec<String>>,
    #[serde(default)]
    pub generic_domains: Option<Vec<String>>,
    #[serde(default)]
    pub stop_words: Option<Vec<String>>,
}

impl LearningConfig {
    pub fn tables(&self) -> LearningTables {
        let mut tables = LearningTables::default();
        if let Some(apps) = &self.generic_apps {
            tables.generic_apps = lowercase_all(apps);
        }
        if let Some(domains) = &self.generic_domains {
            tables.generic_domains = lowercase_all(domains);
        }
        if let Some(words) = &self.stop_words {
            tables.stop_words = lowercase_all(words);
        }
        tables
    }
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.trim().to_lowercase()).collect()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DetectionConfig {
    /// Keyword -> project name.
    #[serde(default)]
    pub keywords: BTreeMap<String, String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate assignment
    if !(0.0..=1.0).contains(&config.assignment.min_confidence) {
        anyhow::bail!("assignment.min_confidence must be in [0.0, 1.0]");
    }
    if config.assignment.cache_ttl_secs == 0 {
        anyhow::bail!("assignment.cache_ttl_secs must be > 0");
    }
    if config.assignment.neighbors == 0 {
        anyhow::bail!("assignment.neighbors must be > 0");
    }

    // Validate backfill
    if config.backfill.batch_size == 0 {
        anyhow::bail!("backfill.batch_size must be > 0");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.max_seq_len < 2 {
        anyhow::bail!("embedding.max_seq_len must be >= 2");
    }
    match config.embedding.backend.as_str() {
        "pseudo" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding backend: '{}'. Must be pseudo or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("traq.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let (_dir, path) = write_config("[db]\npath = \"./data/traq.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.embedding.backend, "pseudo");
        assert_eq!(config.embedding.dims, EMBEDDING_DIMS);
        assert_eq!(config.assignment.min_confidence, 0.5);
        assert_eq!(config.assignment.cache_ttl_secs, 300);
        assert_eq!(config.backfill.batch_size, 100);
        assert!(config.detection.keywords.is_empty());
    }

    #[test]
    fn test_overrides_and_keywords() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "x.sqlite"

[assignment]
min_confidence = 0.7

[learning]
stop_words = ["Foo"]

[detection.keywords]
traq = "Traq"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.assignment.min_confidence, 0.7);
        let tables = config.learning.tables();
        assert_eq!(tables.stop_words, vec!["foo"]);
        assert!(!tables.generic_apps.is_empty());
        assert_eq!(config.detection.keywords.get("traq").map(String::as_str), Some("Traq"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let (_dir, path) = write_config("[db]\npath = \"x\"\n[assignment]\nmin_confidence = 1.5\n");
        assert!(load_config(&path).is_err());

        let (_dir, path) = write_config("[db]\npath = \"x\"\n[embedding]\nbackend = \"openai\"\n");
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("Unknown embedding backend"));

        let (_dir, path) = write_config("[assignment]\nneighbors = 3\n");
        assert!(load_config(&path).is_err());
    }
}
