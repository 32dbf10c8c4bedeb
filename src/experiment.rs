//! Experiment records: lifecycle state, progress counters, and ETA.
//!
//! Lifecycle: `created → running → {completed, failed}`. A `created` experiment
//! may also fail before it starts. Terminal states are final, except that a
//! failed experiment can be reopened once its dataset checksum has been
//! re-verified.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::{ChecksumStatus, Fingerprint};
use crate::store::{now_epoch_ms, Store, StoreError};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub configuration_fingerprint: String,
    pub dataset_checksum: Fingerprint,
    pub status: ExperimentStatus,
    pub total_items: u64,
    pub completed_items: u64,
    pub started_at: Option<i64>,
    pub last_progress_at: Option<i64>,
    pub estimated_completion_at: Option<i64>,
    pub session_started_at: Option<i64>,
    pub session_base_items: u64,
    pub failure_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub finished_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Experiment {
    pub fn remaining_items(&self) -> u64 {
        self.total_items.saturating_sub(self.completed_items)
    }
}

#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub id: String,
    pub configuration_fingerprint: String,
    pub dataset_checksum: Fingerprint,
    pub total_items: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("experiment already exists: {0}")]
    AlreadyExists(String),
    #[error("experiment {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ExperimentStatus,
        to: ExperimentStatus,
    },
    #[error("experiment {id}: {completed} of {total} items recorded, cannot complete")]
    IncompleteWork { id: String, completed: u64, total: u64 },
    #[error("experiment {0}: reopening a failed experiment requires a matching dataset checksum")]
    NotReverified(String),
}

impl From<rusqlite::Error> for ExperimentError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

pub fn generate_id() -> String {
    format!("exp-{}", Uuid::new_v4().simple())
}

// =============================================================================
// Store
// =============================================================================

const SELECT_COLUMNS: &str = "id, configuration_fingerprint, dataset_checksum, status, total_items, \
     completed_items, started_at, last_progress_at, estimated_completion_at, session_started_at, \
     session_base_items, failure_stage, failure_reason, finished_at, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct ExperimentStore {
    store: Store,
}

impl ExperimentStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, new: NewExperiment) -> Result<Experiment, ExperimentError> {
        self.store
            .call(move |conn| {
                let now = now_epoch_ms();
                let inserted = conn.execute(
                    "INSERT INTO experiments (id, configuration_fingerprint, dataset_checksum, \
                     status, total_items, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) ON CONFLICT(id) DO NOTHING",
                    params![
                        new.id,
                        new.configuration_fingerprint,
                        new.dataset_checksum.as_str(),
                        ExperimentStatus::Created.as_str(),
                        new.total_items as i64,
                        now,
                        now,
                    ],
                )?;
                if inserted == 0 {
                    return Err(ExperimentError::AlreadyExists(new.id));
                }
                fetch(conn, &new.id)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Experiment, ExperimentError> {
        let id = id.to_string();
        self.store.call(move |conn| fetch(conn, &id)).await
    }

    pub async fn find(&self, id: &str) -> Result<Option<Experiment>, ExperimentError> {
        let id = id.to_string();
        self.store.call(move |conn| fetch_optional(conn, &id)).await
    }

    pub async fn list(&self) -> Result<Vec<Experiment>, ExperimentError> {
        self.store
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM experiments ORDER BY created_at DESC, id"
                ))?;
                let mut rows = stmt.query([])?;
                let mut experiments = Vec::new();
                while let Some(row) = rows.next()? {
                    experiments.push(row_to_experiment(row)?);
                }
                Ok(experiments)
            })
            .await
    }

    /// Enter (or re-enter) `running` for a new worker session.
    ///
    /// Resynchronises `completed_items` with the ledger without ever lowering it,
    /// and restarts the throughput window used for the ETA.
    pub async fn start_session(&self, id: &str) -> Result<Experiment, ExperimentError> {
        let id = id.to_string();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = fetch(&tx, &id)?;
                if current.status.is_terminal() {
                    return Err(ExperimentError::InvalidTransition {
                        id,
                        from: current.status,
                        to: ExperimentStatus::Running,
                    });
                }
                begin_running(&tx, &id)?;
                let updated = fetch(&tx, &id)?;
                tx.commit()?;
                Ok(updated)
            })
            .await
    }

    /// Move a failed experiment back to `running`. Only a verified checksum
    /// match is accepted as proof that the failure cause was addressed.
    pub async fn reopen(
        &self,
        id: &str,
        verification: &ChecksumStatus,
    ) -> Result<Experiment, ExperimentError> {
        if *verification != ChecksumStatus::Match {
            return Err(ExperimentError::NotReverified(id.to_string()));
        }
        let id = id.to_string();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = fetch(&tx, &id)?;
                if current.status != ExperimentStatus::Failed {
                    return Err(ExperimentError::InvalidTransition {
                        id,
                        from: current.status,
                        to: ExperimentStatus::Running,
                    });
                }
                tx.execute(
                    "UPDATE experiments SET failure_stage = NULL, failure_reason = NULL, \
                     finished_at = NULL WHERE id = ?1",
                    params![id],
                )?;
                begin_running(&tx, &id)?;
                let updated = fetch(&tx, &id)?;
                tx.commit()?;
                tracing::info!(experiment_id = %id, "reopened failed experiment");
                Ok(updated)
            })
            .await
    }

    /// Transition to `completed`. Refused unless the ledger holds every
    /// required item.
    pub async fn complete(&self, id: &str) -> Result<Experiment, ExperimentError> {
        let id = id.to_string();
        self.store
            .call(move |conn| {
                let now = now_epoch_ms();
                let rows = conn.execute(
                    "UPDATE experiments SET status = ?2, finished_at = ?3, \
                     estimated_completion_at = ?3, \
                     last_progress_at = MAX(COALESCE(last_progress_at, 0), ?3), updated_at = ?3 \
                     WHERE id = ?1 AND status = 'running' \
                     AND (SELECT COUNT(*) FROM results WHERE experiment_id = ?1) >= total_items",
                    params![id, ExperimentStatus::Completed.as_str(), now],
                )?;
                let current = fetch(conn, &id)?;
                if rows == 0 {
                    if current.status != ExperimentStatus::Running {
                        return Err(ExperimentError::InvalidTransition {
                            id,
                            from: current.status,
                            to: ExperimentStatus::Completed,
                        });
                    }
                    return Err(ExperimentError::IncompleteWork {
                        id,
                        completed: current.completed_items,
                        total: current.total_items,
                    });
                }
                Ok(current)
            })
            .await
    }

    pub async fn fail(
        &self,
        id: &str,
        stage: &str,
        reason: &str,
    ) -> Result<Experiment, ExperimentError> {
        let id = id.to_string();
        let stage = stage.to_string();
        let reason = reason.to_string();
        self.store
            .call(move |conn| {
                let now = now_epoch_ms();
                let rows = conn.execute(
                    "UPDATE experiments SET status = ?2, failure_stage = ?3, failure_reason = ?4, \
                     finished_at = ?5, estimated_completion_at = NULL, updated_at = ?5 \
                     WHERE id = ?1 AND status IN ('created', 'running')",
                    params![id, ExperimentStatus::Failed.as_str(), stage, reason, now],
                )?;
                let current = fetch(conn, &id)?;
                if rows == 0 {
                    return Err(ExperimentError::InvalidTransition {
                        id,
                        from: current.status,
                        to: ExperimentStatus::Failed,
                    });
                }
                Ok(current)
            })
            .await
    }

    /// Advance progress by `delta` items and refresh the ETA.
    ///
    /// Monotonic: `completed_items` never decreases and never exceeds the
    /// ledger's row count; `last_progress_at` never moves backwards.
    pub async fn update_progress(
        &self,
        id: &str,
        delta: u64,
    ) -> Result<Experiment, ExperimentError> {
        let id = id.to_string();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                apply_progress(&tx, &id, delta, now_epoch_ms())?;
                let updated = fetch(&tx, &id)?;
                tx.commit()?;
                Ok(updated)
            })
            .await
    }
}

fn begin_running(conn: &Connection, id: &str) -> Result<(), ExperimentError> {
    let now = now_epoch_ms();
    conn.execute(
        "UPDATE experiments SET status = ?2, started_at = COALESCE(started_at, ?3), \
         completed_items = MAX(completed_items, \
            (SELECT COUNT(*) FROM results WHERE experiment_id = ?1)), \
         last_progress_at = MAX(COALESCE(last_progress_at, 0), ?3), \
         session_started_at = ?3, updated_at = ?3 WHERE id = ?1",
        params![id, ExperimentStatus::Running.as_str(), now],
    )?;
    conn.execute(
        "UPDATE experiments SET session_base_items = completed_items, \
         estimated_completion_at = NULL WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Shared by [`ExperimentStore::update_progress`] and the ledger's insert path;
/// runs inside the caller's transaction.
pub(crate) fn apply_progress(
    conn: &Connection,
    id: &str,
    delta: u64,
    now: i64,
) -> Result<(), StoreError> {
    let row = conn
        .query_row(
            "SELECT completed_items, total_items, last_progress_at, session_started_at, \
             session_base_items, (SELECT COUNT(*) FROM results WHERE experiment_id = ?1) \
             FROM experiments WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("experiment {id}")))?;
    let (completed, total, last_progress, session_started, session_base, ledger_count) = row;

    let completed = completed.max(completed.saturating_add(delta as i64).min(ledger_count)) as u64;
    let last_progress = last_progress.unwrap_or(0).max(now);
    let eta = estimate_completion(
        now,
        session_started,
        session_base.max(0) as u64,
        completed,
        total.max(0) as u64,
    );
    conn.execute(
        "UPDATE experiments SET completed_items = ?2, last_progress_at = ?3, \
         estimated_completion_at = ?4, updated_at = ?5 WHERE id = ?1",
        params![id, completed as i64, last_progress, eta, now],
    )?;
    Ok(())
}

/// Extrapolate a completion time from the current session's throughput.
///
/// Returns `None` until the session has processed at least one item.
pub fn estimate_completion(
    now: i64,
    session_started_at: Option<i64>,
    session_base_items: u64,
    completed_items: u64,
    total_items: u64,
) -> Option<i64> {
    if completed_items >= total_items {
        return Some(now);
    }
    let started = session_started_at?;
    let processed = completed_items.saturating_sub(session_base_items);
    if processed == 0 {
        return None;
    }
    let elapsed = now.saturating_sub(started).max(0) as f64;
    let per_item = elapsed / processed as f64;
    let remaining = (total_items - completed_items) as f64;
    Some(now + (per_item * remaining).round() as i64)
}

fn fetch(conn: &Connection, id: &str) -> Result<Experiment, ExperimentError> {
    fetch_optional(conn, id)?.ok_or_else(|| ExperimentError::NotFound(id.to_string()))
}

fn fetch_optional(conn: &Connection, id: &str) -> Result<Option<Experiment>, ExperimentError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM experiments WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_experiment(row)?)),
        None => Ok(None),
    }
}

fn row_to_experiment(row: &rusqlite::Row<'_>) -> Result<Experiment, ExperimentError> {
    let status: String = row.get(3)?;
    let status = ExperimentStatus::parse(&status)
        .ok_or_else(|| StoreError::Serde(format!("unknown experiment status {status:?}")))?;
    Ok(Experiment {
        id: row.get(0)?,
        configuration_fingerprint: row.get(1)?,
        dataset_checksum: Fingerprint::from_hex(row.get::<_, String>(2)?),
        status,
        total_items: row.get::<_, i64>(4)?.max(0) as u64,
        completed_items: row.get::<_, i64>(5)?.max(0) as u64,
        started_at: row.get(6)?,
        last_progress_at: row.get(7)?,
        estimated_completion_at: row.get(8)?,
        session_started_at: row.get(9)?,
        session_base_items: row.get::<_, i64>(10)?.max(0) as u64,
        failure_stage: row.get(11)?,
        failure_reason: row.get(12)?,
        finished_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}
