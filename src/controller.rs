//! Execution controller: drives one experiment from dataset to decisions.
//!
//! A run reads and fingerprints the dataset, resolves the experiment, verifies
//! the dataset has not drifted, loads it into the source store, takes the
//! resume lock, and then classifies every (case, category) pair the ledger does
//! not already hold. Interrupting a run at any point leaves only committed
//! ledger rows behind; the next resume recomputes remaining work from them.

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::checksum::{self, ChecksumStatus, Fingerprint};
use crate::classifier::{classify_with_policy, Classifier, ClassifierError, RetryPolicy};
use crate::config::{ConfigError, ExperimentConfig};
use crate::experiment::{
    self, Experiment, ExperimentError, ExperimentStatus, ExperimentStore, NewExperiment,
};
use crate::ledger::{Ledger, Outcome, RecordStatus, WorkItem};
use crate::lock::{LockAcquisition, ResumeLock, ResumeLocks};
use crate::reconcile::{reconcile_from_ledger, DecisionTally, ReconciledDecision};
use crate::source::{self, SourceError, SourceFilter, SourceRecord, SourceStore};
use crate::store::{format_epoch_ms, Store};

/// Error recorded for records whose text is null.
pub const MISSING_TEXT: &str = "missing text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Configure,
    ReadDataset,
    ResolveExperiment,
    VerifyChecksum,
    LoadSource,
    AcquireLock,
    PlanWork,
    StartSession,
    Classify,
    Record,
    Finalize,
    Reconcile,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::ReadDataset => "read_dataset",
            Self::ResolveExperiment => "resolve_experiment",
            Self::VerifyChecksum => "verify_checksum",
            Self::LoadSource => "load_source",
            Self::AcquireLock => "acquire_lock",
            Self::PlanWork => "plan_work",
            Self::StartSession => "start_session",
            Self::Classify => "classify",
            Self::Record => "record",
            Self::Finalize => "finalize",
            Self::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("experiment {experiment_id}: invalid configuration: {source}")]
    Config {
        experiment_id: String,
        source: ConfigError,
    },

    #[error("experiment {experiment_id} [{stage}]: {source}")]
    Source {
        experiment_id: String,
        stage: RunStage,
        source: SourceError,
    },

    /// The id is taken and the configuration does not ask to resume it.
    #[error("experiment {experiment_id} already exists; set resume = true to continue it")]
    ExperimentExists { experiment_id: String },

    #[error("experiment {experiment_id} is {status}; set retry_failed = true to reopen it")]
    Terminal {
        experiment_id: String,
        status: ExperimentStatus,
    },

    /// The dataset changed since the experiment started. Nothing was modified.
    #[error(
        "experiment {experiment_id}: dataset checksum mismatch (stored {}, current {})",
        .stored.short(),
        .current.short()
    )]
    Integrity {
        experiment_id: String,
        stored: Fingerprint,
        current: Fingerprint,
    },

    /// Another live process holds the resume lock. Nothing was modified.
    #[error("experiment {experiment_id}: {holder}")]
    Contention {
        experiment_id: String,
        holder: ResumeLock,
    },

    /// The classifier cannot make progress; the experiment was marked failed.
    #[error("experiment {experiment_id} [{stage}]: {reason}")]
    Systemic {
        experiment_id: String,
        stage: RunStage,
        reason: String,
    },

    #[error("experiment {experiment_id} [{stage}]: {source}")]
    Storage {
        experiment_id: String,
        stage: RunStage,
        source: ExperimentError,
    },
}

impl RunError {
    pub fn experiment_id(&self) -> &str {
        match self {
            Self::Config { experiment_id, .. }
            | Self::Source { experiment_id, .. }
            | Self::ExperimentExists { experiment_id }
            | Self::Terminal { experiment_id, .. }
            | Self::Integrity { experiment_id, .. }
            | Self::Contention { experiment_id, .. }
            | Self::Systemic { experiment_id, .. }
            | Self::Storage { experiment_id, .. } => experiment_id,
        }
    }

    pub fn stage(&self) -> RunStage {
        match self {
            Self::Config { .. } => RunStage::Configure,
            Self::ExperimentExists { .. } | Self::Terminal { .. } => RunStage::ResolveExperiment,
            Self::Integrity { .. } => RunStage::VerifyChecksum,
            Self::Contention { .. } => RunStage::AcquireLock,
            Self::Source { stage, .. } | Self::Systemic { stage, .. } | Self::Storage { stage, .. } => {
                *stage
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    /// True when the experiment already existed before this invocation.
    pub resumed: bool,
    pub total_items: u64,
    pub completed_items: u64,
    /// Items handled by this invocation.
    pub processed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Items recorded with an error in this invocation.
    pub errors: usize,
    pub remaining: u64,
    pub elapsed: Duration,
    /// Empty unless this invocation completed the experiment.
    pub decisions: Vec<ReconciledDecision>,
}

impl RunSummary {
    fn untouched(experiment: &Experiment, elapsed: Duration) -> Self {
        Self {
            experiment_id: experiment.id.clone(),
            status: experiment.status,
            resumed: true,
            total_items: experiment.total_items,
            completed_items: experiment.completed_items,
            processed: 0,
            inserted: 0,
            duplicates: 0,
            errors: 0,
            remaining: experiment.remaining_items(),
            elapsed,
            decisions: Vec::new(),
        }
    }

    pub fn tally(&self) -> DecisionTally {
        DecisionTally::from_decisions(&self.decisions)
    }
}

fn storage<E: Into<ExperimentError>>(
    experiment_id: &str,
    stage: RunStage,
) -> impl FnOnce(E) -> RunError {
    let experiment_id = experiment_id.to_string();
    move |e| RunError::Storage {
        experiment_id,
        stage,
        source: e.into(),
    }
}

fn source_error(experiment_id: &str, stage: RunStage) -> impl FnOnce(SourceError) -> RunError {
    let experiment_id = experiment_id.to_string();
    move |source| RunError::Source {
        experiment_id,
        stage,
        source,
    }
}

/// Run (or resume) the experiment described by `config`.
pub async fn run(
    store: &Store,
    config: &ExperimentConfig,
    classifier: Arc<dyn Classifier>,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let experiment_id = config
        .experiment_id
        .clone()
        .unwrap_or_else(experiment::generate_id);
    let id = experiment_id.as_str();
    config.validate().map_err(|source| RunError::Config {
        experiment_id: experiment_id.clone(),
        source,
    })?;

    let sources = SourceStore::new(store.clone());
    let experiments = ExperimentStore::new(store.clone());
    let locks = ResumeLocks::new(store.clone());

    let records =
        source::read_dataset(&config.dataset).map_err(source_error(id, RunStage::ReadDataset))?;

    let existing = experiments
        .find(id)
        .await
        .map_err(storage(id, RunStage::ResolveExperiment))?;
    if let Some(existing) = &existing {
        if !config.resume {
            return Err(RunError::ExperimentExists {
                experiment_id: experiment_id.clone(),
            });
        }
        match existing.status {
            ExperimentStatus::Completed => {
                tracing::info!(experiment_id = %id, "experiment already completed; nothing to do");
                return Ok(RunSummary::untouched(existing, started.elapsed()));
            }
            ExperimentStatus::Failed if !config.retry_failed => {
                return Err(RunError::Terminal {
                    experiment_id: experiment_id.clone(),
                    status: existing.status,
                });
            }
            _ => {}
        }
    }

    let verification = checksum::verify(existing.as_ref().map(|e| &e.dataset_checksum), &records);
    if let ChecksumStatus::Mismatch { stored, current } = &verification {
        tracing::error!(
            experiment_id = %id,
            stored = stored.short(),
            current = current.short(),
            "dataset changed since the experiment started; refusing to resume"
        );
        return Err(RunError::Integrity {
            experiment_id: experiment_id.clone(),
            stored: stored.clone(),
            current: current.clone(),
        });
    }
    let config_fingerprint = config.fingerprint();
    if let Some(existing) = &existing {
        if existing.configuration_fingerprint != config_fingerprint.as_str() {
            tracing::warn!(
                experiment_id = %id,
                stored = %existing.configuration_fingerprint,
                current = config_fingerprint.as_str(),
                "configuration changed since the experiment started"
            );
        }
    }

    let origin = config.dataset.display().to_string();
    let report = sources
        .load_records(&origin, records)
        .await
        .map_err(source_error(id, RunStage::LoadSource))?;
    let required = sources
        .query(
            &SourceFilter::dataset(&report.checksum).categories(config.categories()),
            None,
        )
        .await
        .map_err(source_error(id, RunStage::LoadSource))?;

    let mut resumed = existing.is_some();
    let mut verification = verification;
    let experiment = match existing {
        Some(existing) => {
            if existing.total_items != required.len() as u64 {
                tracing::warn!(
                    experiment_id = %id,
                    stored = existing.total_items,
                    configured = required.len(),
                    "configured categories no longer match the experiment's item count"
                );
            }
            existing
        }
        None => match experiments
            .create(NewExperiment {
                id: experiment_id.clone(),
                configuration_fingerprint: config_fingerprint.as_str().to_string(),
                dataset_checksum: report.checksum.clone(),
                total_items: required.len() as u64,
            })
            .await
        {
            Ok(created) => created,
            // Another worker created the same id between our lookup and insert.
            Err(ExperimentError::AlreadyExists(_)) if config.resume => {
                let raced = experiments
                    .get(id)
                    .await
                    .map_err(storage(id, RunStage::ResolveExperiment))?;
                if raced.dataset_checksum != report.checksum {
                    return Err(RunError::Integrity {
                        experiment_id: experiment_id.clone(),
                        stored: raced.dataset_checksum,
                        current: report.checksum,
                    });
                }
                tracing::info!(experiment_id = %id, "experiment was created concurrently; resuming it");
                resumed = true;
                verification = ChecksumStatus::Match;
                raced
            }
            Err(ExperimentError::AlreadyExists(_)) => {
                return Err(RunError::ExperimentExists {
                    experiment_id: experiment_id.clone(),
                })
            }
            Err(other) => return Err(storage(id, RunStage::ResolveExperiment)(other)),
        },
    };

    let guard = match locks
        .acquire(id)
        .await
        .map_err(storage(id, RunStage::AcquireLock))?
    {
        LockAcquisition::Acquired(guard) => guard,
        LockAcquisition::AlreadyHeld(holder) => {
            tracing::warn!(experiment_id = %id, holder_pid = holder.holder_pid, "resume lock held by a live process");
            return Err(RunError::Contention {
                experiment_id: experiment_id.clone(),
                holder,
            });
        }
    };

    let session = Session {
        config,
        experiments: &experiments,
        ledger: Ledger::new(store.clone()),
        classifier: classifier.as_ref(),
        experiment_id: id,
        resumed,
        started,
    };
    let result = session.execute(experiment, required, &verification).await;

    if let Err(e) = guard.release().await {
        tracing::warn!(experiment_id = %id, error = %e, "failed to release resume lock");
    }
    result
}

/// What happened to one work item before it reached the ledger.
enum Evaluation {
    Classified(Outcome),
    MissingText(Outcome),
    /// A per-item failure that retrying did not fix.
    Exhausted(Outcome, ClassifierError),
    Systemic(ClassifierError),
}

async fn evaluate(
    classifier: &dyn Classifier,
    record: &SourceRecord,
    policy: &RetryPolicy,
    timeout: Duration,
) -> Evaluation {
    let Some(text) = record.text.as_deref() else {
        tracing::debug!(case_id = %record.case_id, category = %record.category, "no text; recording unknown");
        return Evaluation::MissingText(Outcome::failed(MISSING_TEXT));
    };
    match classify_with_policy(classifier, text, &record.category, policy, timeout).await {
        Ok(classification) => Evaluation::Classified(classification.into_outcome()),
        Err(err) if err.is_systemic() => Evaluation::Systemic(err),
        Err(err) => Evaluation::Exhausted(Outcome::failed(err.to_string()), err),
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: usize,
    inserted: usize,
    duplicates: usize,
    errors: usize,
    consecutive_failures: usize,
}

/// Everything a run needs once the lock is held.
struct Session<'a> {
    config: &'a ExperimentConfig,
    experiments: &'a ExperimentStore,
    ledger: Ledger,
    classifier: &'a dyn Classifier,
    experiment_id: &'a str,
    resumed: bool,
    started: Instant,
}

impl Session<'_> {
    async fn execute(
        &self,
        experiment: Experiment,
        required: Vec<SourceRecord>,
        verification: &ChecksumStatus,
    ) -> Result<RunSummary, RunError> {
        let id = self.experiment_id;

        // Another process may have finished or failed the experiment while we
        // waited for the lock.
        let experiment = self
            .experiments
            .get(&experiment.id)
            .await
            .map_err(storage(id, RunStage::StartSession))?;
        match experiment.status {
            ExperimentStatus::Completed => {
                return Ok(RunSummary::untouched(&experiment, self.started.elapsed()))
            }
            ExperimentStatus::Failed if !self.config.retry_failed => {
                return Err(RunError::Terminal {
                    experiment_id: id.to_string(),
                    status: experiment.status,
                })
            }
            _ => {}
        }

        let completed = self
            .ledger
            .query_completed(id)
            .await
            .map_err(storage(id, RunStage::PlanWork))?;
        let mut remaining: Vec<SourceRecord> = required
            .into_iter()
            .filter(|r| !completed.contains(&WorkItem::new(r.case_id.clone(), r.category.clone())))
            .collect();
        let backlog = remaining.len();
        if let Some(max_items) = self.config.max_items {
            remaining.truncate(max_items);
        }

        let experiment = match experiment.status {
            ExperimentStatus::Failed => self.experiments.reopen(id, verification).await,
            _ => self.experiments.start_session(id).await,
        }
        .map_err(storage(id, RunStage::StartSession))?;

        tracing::info!(
            experiment_id = %id,
            resumed = self.resumed,
            total = experiment.total_items,
            completed = experiment.completed_items,
            backlog,
            batch = remaining.len(),
            concurrency = self.config.concurrency,
            "run started"
        );

        let counters = match self.process(remaining).await? {
            Ok(counters) => counters,
            Err(reason) => {
                tracing::error!(experiment_id = %id, reason = %reason, "aborting run");
                self.experiments
                    .fail(id, RunStage::Classify.as_str(), &reason)
                    .await
                    .map_err(storage(id, RunStage::Classify))?;
                return Err(RunError::Systemic {
                    experiment_id: id.to_string(),
                    stage: RunStage::Classify,
                    reason,
                });
            }
        };

        self.finish(counters).await
    }

    /// Classify and record `batch`. The outer error is a storage failure that
    /// leaves the experiment resumable; the inner error is a systemic abort
    /// reason that fails it.
    async fn process(
        &self,
        batch: Vec<SourceRecord>,
    ) -> Result<Result<Counters, String>, RunError> {
        let id = self.experiment_id;
        let policy = &self.config.retry_policy();
        let timeout = self.config.classifier_timeout();
        let classifier = self.classifier;

        let evaluations = stream::iter(batch)
            .map(|record| async move {
                let evaluation = evaluate(classifier, &record, policy, timeout).await;
                (record, evaluation)
            })
            .buffered(self.config.concurrency);
        let mut evaluations = pin!(evaluations);

        let mut counters = Counters::default();
        while let Some((record, evaluation)) = evaluations.next().await {
            let outcome = match evaluation {
                Evaluation::Systemic(err) => {
                    return Ok(Err(format!(
                        "systemic classifier error on case {} / {}: {err}",
                        record.case_id, record.category
                    )));
                }
                Evaluation::Classified(outcome) => {
                    counters.consecutive_failures = 0;
                    outcome
                }
                Evaluation::MissingText(outcome) => outcome,
                Evaluation::Exhausted(outcome, err) => {
                    counters.consecutive_failures += 1;
                    tracing::warn!(
                        experiment_id = %id,
                        case_id = %record.case_id,
                        category = %record.category,
                        code = err.code(),
                        error = %err,
                        "classifier failed on this item; recording error"
                    );
                    outcome
                }
            };

            let status = self
                .ledger
                .record(id, &record.case_id, &record.category, &outcome)
                .await
                .map_err(storage(id, RunStage::Record))?;
            counters.processed += 1;
            match status {
                RecordStatus::Inserted => counters.inserted += 1,
                RecordStatus::Duplicate => {
                    counters.duplicates += 1;
                    tracing::debug!(case_id = %record.case_id, category = %record.category, "already recorded");
                }
            }
            if outcome.error.is_some() {
                counters.errors += 1;
            }

            if counters.consecutive_failures >= self.config.max_consecutive_errors {
                return Ok(Err(format!(
                    "{} consecutive classifier failures",
                    counters.consecutive_failures
                )));
            }

            if counters.processed % self.config.progress_interval == 0 {
                let progress = self
                    .experiments
                    .update_progress(id, 0)
                    .await
                    .map_err(storage(id, RunStage::Record))?;
                let eta = progress
                    .estimated_completion_at
                    .map(format_epoch_ms)
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::info!(
                    experiment_id = %id,
                    completed = progress.completed_items,
                    total = progress.total_items,
                    errors = counters.errors,
                    eta = %eta,
                    "progress"
                );
            }
        }
        Ok(Ok(counters))
    }

    async fn finish(&self, counters: Counters) -> Result<RunSummary, RunError> {
        let id = self.experiment_id;
        let experiment = self
            .experiments
            .update_progress(id, 0)
            .await
            .map_err(storage(id, RunStage::Finalize))?;
        let recorded = self
            .ledger
            .count(id)
            .await
            .map_err(storage(id, RunStage::Finalize))? as u64;

        let (experiment, decisions) = if recorded >= experiment.total_items {
            let experiment = self
                .experiments
                .complete(id)
                .await
                .map_err(storage(id, RunStage::Finalize))?;
            let decisions =
                reconcile_from_ledger(&self.ledger, id, &self.config.reconcile_config())
                    .await
                    .map_err(storage(id, RunStage::Reconcile))?;
            let tally = DecisionTally::from_decisions(&decisions);
            tracing::info!(
                experiment_id = %id,
                cases = tally.total(),
                detected = tally.detected,
                not_detected = tally.not_detected,
                unknown = tally.unknown,
                "experiment completed"
            );
            (experiment, decisions)
        } else {
            tracing::info!(
                experiment_id = %id,
                completed = experiment.completed_items,
                total = experiment.total_items,
                "stopping with work remaining; resume to continue"
            );
            (experiment, Vec::new())
        };

        Ok(RunSummary {
            experiment_id: id.to_string(),
            status: experiment.status,
            resumed: self.resumed,
            total_items: experiment.total_items,
            completed_items: experiment.completed_items,
            processed: counters.processed,
            inserted: counters.inserted,
            duplicates: counters.duplicates,
            errors: counters.errors,
            remaining: experiment.remaining_items(),
            elapsed: self.started.elapsed(),
            decisions,
        })
    }
}
