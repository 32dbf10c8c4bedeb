#![forbid(unsafe_code)]

//! # triage-harness
//!
//! Resumable LLM classification experiments over a fixed corpus.
//!
//! Every (case, category) pair of a dataset is classified at most once per
//! experiment: outcomes land in an append-only ledger whose uniqueness is
//! enforced by SQLite, progress is derived from that ledger, and a resumed run
//! only does the work the ledger does not already hold. Before resuming, the
//! dataset is re-fingerprinted; a drifted dataset is refused. Per-category
//! outcomes are combined into one decision per case with confidence weighting
//! and a threshold.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use triage_harness::{controller, ExperimentConfig, Store, Classifier};
//! # async fn demo(classifier: Arc<dyn Classifier>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open(Store::default_path())?;
//! let config = ExperimentConfig::from_path("experiment.toml")?;
//! let summary = controller::run(&store, &config, classifier).await?;
//! println!("{} of {} items recorded", summary.completed_items, summary.total_items);
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod experiment;
pub mod gateway;
pub mod ledger;
pub mod lock;
pub mod reconcile;
pub mod source;
pub mod store;

pub use checksum::{ChecksumStatus, Fingerprint};
pub use classifier::{
    Classification, Classifier, ClassifierError, ChatClassifier, ErrorKind, RetryPolicy,
};
pub use config::{ConfigError, ExperimentConfig, RetryConfig};
pub use controller::{run, RunError, RunStage, RunSummary};
pub use experiment::{Experiment, ExperimentError, ExperimentStatus, ExperimentStore};
pub use gateway::{Attribution, ChatGateway, ChatModel, ProviderError};
pub use ledger::{Detected, Ledger, Outcome, RecordStatus, ResultFilter, ResultRecord, WorkItem};
pub use lock::{LockAcquisition, LockGuard, ResumeLock, ResumeLocks};
pub use reconcile::{reconcile, reconcile_experiment, DecisionTally, ReconcileConfig, ReconciledDecision};
pub use source::{Category, SourceError, SourceFilter, SourceRecord, SourceStore};
pub use store::{Store, StoreError};
