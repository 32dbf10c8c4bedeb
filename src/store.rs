//! SQLite storage handle shared by the source store, ledger, experiment records,
//! and resume locks.
//!
//! Every durable collection lives in one database file. Components never open
//! their own connection; they hold a cloned [`Store`] and run blocking SQLite
//! work through [`Store::call`].

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store handle closed")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread waits
    /// on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        create_tables(&conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TRIAGE_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".triage_experiments.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let _permit = self
            .sem
            .acquire()
            .await
            .map_err(|_| E::from(StoreError::Closed))?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| E::from(StoreError::Join(e.to_string())))?
    }

    /// Lock the connection on the current thread.
    ///
    /// A poisoned mutex is recovered: the SQLite connection is still usable.
    pub(crate) fn with_conn<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Connection) -> Result<R, E>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS datasets (\
           checksum TEXT PRIMARY KEY,\
           origin TEXT NOT NULL,\
           record_count INTEGER NOT NULL,\
           loaded_at INTEGER NOT NULL\
         );\
         CREATE TABLE IF NOT EXISTS source_records (\
           dataset_checksum TEXT NOT NULL REFERENCES datasets(checksum),\
           case_id TEXT NOT NULL,\
           category TEXT NOT NULL,\
           text TEXT,\
           record_checksum TEXT NOT NULL,\
           PRIMARY KEY (dataset_checksum, case_id, category)\
         );\
         CREATE TABLE IF NOT EXISTS experiments (\
           id TEXT PRIMARY KEY,\
           configuration_fingerprint TEXT NOT NULL,\
           dataset_checksum TEXT NOT NULL,\
           status TEXT NOT NULL DEFAULT 'created',\
           total_items INTEGER NOT NULL,\
           completed_items INTEGER NOT NULL DEFAULT 0,\
           started_at INTEGER,\
           last_progress_at INTEGER,\
           estimated_completion_at INTEGER,\
           session_started_at INTEGER,\
           session_base_items INTEGER NOT NULL DEFAULT 0,\
           failure_stage TEXT,\
           failure_reason TEXT,\
           finished_at INTEGER,\
           created_at INTEGER NOT NULL,\
           updated_at INTEGER NOT NULL\
         );\
         CREATE TABLE IF NOT EXISTS results (\
           id INTEGER PRIMARY KEY AUTOINCREMENT,\
           experiment_id TEXT NOT NULL REFERENCES experiments(id),\
           case_id TEXT NOT NULL,\
           category TEXT NOT NULL,\
           detected TEXT NOT NULL,\
           confidence REAL,\
           raw_output TEXT NOT NULL,\
           error TEXT,\
           created_at INTEGER NOT NULL,\
           UNIQUE (experiment_id, case_id, category)\
         );\
         CREATE TABLE IF NOT EXISTS resume_locks (\
           experiment_id TEXT PRIMARY KEY,\
           holder_pid INTEGER NOT NULL,\
           holder_token TEXT NOT NULL,\
           acquired_at INTEGER NOT NULL\
         );\
         CREATE INDEX IF NOT EXISTS idx_results_experiment ON results(experiment_id);\
         CREATE INDEX IF NOT EXISTS idx_source_dataset ON source_records(dataset_checksum);",
    )?;
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Render an epoch-millisecond timestamp as RFC 3339 for operators.
pub fn format_epoch_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}
