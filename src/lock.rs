//! Per-experiment resume lock.
//!
//! The lock is a row in `resume_locks` keyed by experiment id. Acquisition
//! runs in an IMMEDIATE transaction, so concurrent acquirers serialise on the
//! SQLite write lock and exactly one of them inserts the row. A row whose
//! holder pid is no longer alive is reclaimed. A row carrying this process's
//! own pid is live only while its token is one this process handed out;
//! otherwise it was left by an earlier process that reused the pid.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

use crate::store::{format_epoch_ms, now_epoch_ms, Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeLock {
    pub experiment_id: String,
    pub holder_pid: u32,
    pub holder_token: String,
    pub acquired_at: i64,
}

/// Tokens of locks acquired and not yet released by this process.
static HELD_TOKENS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

fn held_tokens() -> MutexGuard<'static, BTreeSet<String>> {
    HELD_TOKENS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResumeLock {
    pub fn is_holder_alive(&self) -> bool {
        if self.holder_pid == std::process::id() {
            return held_tokens().contains(&self.holder_token);
        }
        pid_is_alive(self.holder_pid)
    }
}

impl std::fmt::Display for ResumeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "experiment {} locked by pid {} since {}",
            self.experiment_id,
            self.holder_pid,
            format_epoch_ms(self.acquired_at)
        )
    }
}

#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockGuard),
    AlreadyHeld(ResumeLock),
}

#[derive(Clone, Debug)]
pub struct ResumeLocks {
    store: Store,
}

impl ResumeLocks {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn acquire(&self, experiment_id: &str) -> Result<LockAcquisition, StoreError> {
        let experiment_id = experiment_id.to_string();
        let store = self.store.clone();
        self.store
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if let Some(existing) = select_lock(&tx, &experiment_id)? {
                    if existing.is_holder_alive() {
                        return Ok(LockAcquisition::AlreadyHeld(existing));
                    }
                    tracing::warn!(
                        experiment_id = %experiment_id,
                        pid = existing.holder_pid,
                        acquired_at = %format_epoch_ms(existing.acquired_at),
                        "reclaiming resume lock from a process that is no longer running"
                    );
                    tx.execute(
                        "DELETE FROM resume_locks WHERE experiment_id = ?1 AND holder_token = ?2",
                        params![experiment_id, existing.holder_token],
                    )?;
                }
                let lock = ResumeLock {
                    experiment_id: experiment_id.clone(),
                    holder_pid: std::process::id(),
                    holder_token: Uuid::new_v4().to_string(),
                    acquired_at: now_epoch_ms(),
                };
                tx.execute(
                    "INSERT INTO resume_locks (experiment_id, holder_pid, holder_token, acquired_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        lock.experiment_id,
                        lock.holder_pid as i64,
                        lock.holder_token,
                        lock.acquired_at,
                    ],
                )?;
                tx.commit()?;
                held_tokens().insert(lock.holder_token.clone());
                tracing::debug!(experiment_id = %experiment_id, pid = lock.holder_pid, "resume lock acquired");
                Ok(LockAcquisition::Acquired(LockGuard {
                    store,
                    lock,
                    released: false,
                }))
            })
            .await
    }

    pub async fn current(&self, experiment_id: &str) -> Result<Option<ResumeLock>, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.store
            .call(move |conn| select_lock(conn, &experiment_id))
            .await
    }
}

/// Held lock. Release explicitly with [`LockGuard::release`]; dropping an
/// unreleased guard deletes the row best-effort.
#[derive(Debug)]
pub struct LockGuard {
    store: Store,
    lock: ResumeLock,
    released: bool,
}

impl LockGuard {
    pub fn lock(&self) -> &ResumeLock {
        &self.lock
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        let lock = self.lock.clone();
        self.released = true;
        self.store
            .call(move |conn| delete_lock(conn, &lock))
            .await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let lock = self.lock.clone();
        if let Err(e) = self.store.with_conn(|conn| delete_lock(conn, &lock)) {
            tracing::warn!(experiment_id = %lock.experiment_id, error = %e, "failed to release resume lock on drop");
        }
    }
}

fn delete_lock(conn: &Connection, lock: &ResumeLock) -> Result<(), StoreError> {
    held_tokens().remove(&lock.holder_token);
    conn.execute(
        "DELETE FROM resume_locks WHERE experiment_id = ?1 AND holder_token = ?2",
        params![lock.experiment_id, lock.holder_token],
    )?;
    Ok(())
}

fn select_lock(conn: &Connection, experiment_id: &str) -> Result<Option<ResumeLock>, StoreError> {
    let lock = conn
        .query_row(
            "SELECT experiment_id, holder_pid, holder_token, acquired_at \
             FROM resume_locks WHERE experiment_id = ?1",
            params![experiment_id],
            |row| {
                Ok(ResumeLock {
                    experiment_id: row.get(0)?,
                    holder_pid: row.get::<_, i64>(1)?.clamp(0, u32::MAX as i64) as u32,
                    holder_token: row.get(2)?,
                    acquired_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(lock)
}

/// Whether a process with this pid exists on the local host.
#[cfg(target_os = "linux")]
pub fn pid_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Without a portable liveness probe, every holder is presumed alive.
#[cfg(not(target_os = "linux"))]
pub fn pid_is_alive(_pid: u32) -> bool {
    true
}
