//! Experiment configuration.
//!
//! Parsed from JSON or TOML (chosen by file extension), with defaults resolved at
//! load and every field validated before a run starts.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::Fingerprint;
use crate::classifier::RetryPolicy;
use crate::reconcile::ReconcileConfig;
use crate::source::Category;

pub const DEFAULT_THRESHOLD: f64 = 0.7;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format for {} (expected .json or .toml)", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// JSONL dataset. Relative paths resolve against the config file's directory.
    pub dataset: PathBuf,
    /// Category weights. The key set is the set of categories the experiment requires.
    pub weights: BTreeMap<Category, f64>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub experiment_id: Option<String>,
    /// Cap on items processed by one invocation.
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Allow resuming a failed experiment once its dataset re-verifies.
    #[serde(default)]
    pub retry_failed: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_classifier_timeout_secs")]
    pub classifier_timeout_secs: u64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_concurrency() -> usize {
    1
}

fn default_classifier_timeout_secs() -> u64 {
    60
}

fn default_progress_interval() -> usize {
    25
}

fn default_max_consecutive_errors() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.1
}

impl ExperimentConfig {
    /// A config with every optional field at its default.
    pub fn new(dataset: impl Into<PathBuf>, weights: BTreeMap<Category, f64>) -> Self {
        Self {
            dataset: dataset.into(),
            weights,
            threshold: default_threshold(),
            resume: false,
            experiment_id: None,
            max_items: None,
            retry_failed: false,
            concurrency: default_concurrency(),
            classifier_timeout_secs: default_classifier_timeout_secs(),
            progress_interval: default_progress_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::parse_json(&raw)?,
            Some("toml") => Self::parse_toml(&raw)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        if config.dataset.is_relative() {
            if let Some(dir) = path.parent() {
                config.dataset = dir.join(&config.dataset);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_json(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_toml(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn parse_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Reject values no run can use. A weight sum other than 1.0 only warns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.dataset.as_os_str().is_empty() {
            return invalid("dataset path is empty".into());
        }
        if self.weights.is_empty() {
            return invalid("weights must name at least one category".into());
        }
        for (category, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return invalid(format!("weight for {category} must be a non-negative number, got {weight}"));
            }
        }
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return invalid(format!("threshold must be within [0, 1], got {}", self.threshold));
        }
        if let Some(id) = &self.experiment_id {
            if id.trim().is_empty() {
                return invalid("experiment_id is empty".into());
            }
        }
        if self.max_items == Some(0) {
            return invalid("max_items must be at least 1".into());
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.classifier_timeout_secs == 0 {
            return invalid("classifier_timeout_secs must be at least 1".into());
        }
        if self.progress_interval == 0 {
            return invalid("progress_interval must be at least 1".into());
        }
        if self.max_consecutive_errors == 0 {
            return invalid("max_consecutive_errors must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms exceeds retry.max_delay_ms".into());
        }
        if !self.retry.jitter.is_finite() || !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid(format!("retry.jitter must be within [0, 1], got {}", self.retry.jitter));
        }

        let sum = self.weight_sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            tracing::warn!(weight_sum = sum, "category weights do not sum to 1.0; using them as given");
        }
        Ok(())
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.weights.keys().cloned().collect()
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            weights: self.weights.clone(),
            threshold: self.threshold,
        }
    }

    /// Identity of the settings that shape results: weights and threshold.
    /// Run-control knobs (resume, limits, retry, concurrency) and the dataset
    /// path are excluded; dataset identity is tracked by its checksum.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"triage-config-v1\0");
        for (category, weight) in &self.weights {
            hasher.update(category.as_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(&weight.to_bits().to_le_bytes());
        }
        hasher.update(&self.threshold.to_bits().to_le_bytes());
        Fingerprint::from_hex(hasher.finalize().to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_JSON: &str = r#"{
        "dataset": "cases.jsonl",
        "weights": {"self_harm": 0.4, "violence": 0.6}
    }"#;

    #[test]
    fn defaults_resolve_at_load() {
        let config = ExperimentConfig::from_json_str(MINIMAL_JSON).unwrap();
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
        assert!(!config.resume);
        assert!(!config.retry_failed);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.classifier_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.categories().len(), 2);
    }

    #[test]
    fn toml_and_json_agree() {
        let toml = r#"
            dataset = "cases.jsonl"
            threshold = 0.7

            [weights]
            self_harm = 0.4
            violence = 0.6
        "#;
        let from_toml = ExperimentConfig::from_toml_str(toml).unwrap();
        let from_json = ExperimentConfig::from_json_str(MINIMAL_JSON).unwrap();
        assert_eq!(from_toml, from_json);
        assert_eq!(from_toml.fingerprint(), from_json.fingerprint());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"dataset": "a.jsonl", "weights": {"a": 1.0}, "treshold": 0.5}"#;
        assert!(matches!(
            ExperimentConfig::from_json_str(raw),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for raw in [
            r#"{"dataset": "a.jsonl", "weights": {}}"#,
            r#"{"dataset": "a.jsonl", "weights": {"a": -0.1}}"#,
            r#"{"dataset": "a.jsonl", "weights": {"a": 1.0}, "threshold": 1.5}"#,
            r#"{"dataset": "a.jsonl", "weights": {"a": 1.0}, "concurrency": 0}"#,
            r#"{"dataset": "a.jsonl", "weights": {"a": 1.0}, "retry": {"max_attempts": 0}}"#,
        ] {
            assert!(
                matches!(ExperimentConfig::from_json_str(raw), Err(ConfigError::Invalid(_))),
                "accepted {raw}"
            );
        }
        let bad_category = r#"{"dataset": "a.jsonl", "weights": {"Not Valid!": 1.0}}"#;
        assert!(ExperimentConfig::from_json_str(bad_category).is_err());
    }

    #[test]
    fn weights_off_one_only_warn() {
        let raw = r#"{"dataset": "a.jsonl", "weights": {"a": 0.5, "b": 0.9}}"#;
        let config = ExperimentConfig::from_json_str(raw).unwrap();
        assert!((config.weight_sum() - 1.4).abs() < 1e-9);
    }

    #[test]
    fn fingerprint_tracks_weights_and_threshold_only() {
        let base = ExperimentConfig::from_json_str(MINIMAL_JSON).unwrap();
        let mut knobs = base.clone();
        knobs.resume = true;
        knobs.max_items = Some(5);
        knobs.concurrency = 4;
        assert_eq!(base.fingerprint(), knobs.fingerprint());

        let mut threshold = base.clone();
        threshold.threshold = 0.5;
        assert_ne!(base.fingerprint(), threshold.fingerprint());
    }

    #[test]
    fn from_path_resolves_dataset_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.toml");
        std::fs::write(
            &path,
            "dataset = \"cases.jsonl\"\n[weights]\nself_harm = 1.0\n",
        )
        .unwrap();
        let config = ExperimentConfig::from_path(&path).unwrap();
        assert_eq!(config.dataset, dir.path().join("cases.jsonl"));

        let yaml = dir.path().join("experiment.yaml");
        std::fs::write(&yaml, "dataset: x").unwrap();
        assert!(matches!(
            ExperimentConfig::from_path(&yaml),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
