//! Append-only result ledger: one row per (experiment, case, category).
//!
//! Uniqueness is enforced by the `results` table's UNIQUE constraint, not by
//! callers. A repeated write is reported as [`RecordStatus::Duplicate`] and
//! leaves the stored row untouched. An insert and the owning experiment's
//! progress bump commit in one transaction, so `completed_items` always equals
//! the number of ledger rows for that experiment.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use crate::experiment;
use crate::source::Category;
use crate::store::{now_epoch_ms, Store, StoreError};

// =============================================================================
// Types
// =============================================================================

/// Tri-state classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Detected {
    #[serde(rename = "true")]
    Yes,
    #[serde(rename = "false")]
    No,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Detected {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Yes => Some(true),
            Self::No => Some(false),
            Self::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "true",
            Self::No => "false",
            Self::Unknown => "unknown",
        }
    }

    /// Parse the stored text form; `None` for anything unrecognised.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "true" => Some(Self::Yes),
            "false" => Some(Self::No),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// What gets written for one (case, category). Built by value:
///
/// ```
/// use triage_harness::ledger::Outcome;
/// let outcome = Outcome::detected(true).confidence(0.8).raw_output("{\"detected\":true}");
/// assert!(outcome.is_determinate());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub detected: Detected,
    pub confidence: Option<f64>,
    pub raw_output: String,
    pub error: Option<String>,
}

impl Outcome {
    pub fn new(detected: Detected) -> Self {
        Self {
            detected,
            confidence: None,
            raw_output: String::new(),
            error: None,
        }
    }

    pub fn detected(value: bool) -> Self {
        Self::new(Detected::from_bool(value))
    }

    pub fn unknown() -> Self {
        Self::new(Detected::Unknown)
    }

    /// An `unknown` outcome carrying a per-item error.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::unknown().error(error)
    }

    /// Non-finite confidences are dropped; finite ones are clamped to [0, 1].
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.is_finite().then(|| confidence.clamp(0.0, 1.0));
        self
    }

    pub fn maybe_confidence(self, confidence: Option<f64>) -> Self {
        match confidence {
            Some(c) => self.confidence(c),
            None => Self {
                confidence: None,
                ..self
            },
        }
    }

    pub fn raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = raw.into();
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_determinate(&self) -> bool {
        is_determinate(self.detected, self.confidence, self.error.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub experiment_id: String,
    pub case_id: String,
    pub category: Category,
    pub detected: Detected,
    pub confidence: Option<f64>,
    pub raw_output: String,
    pub error: Option<String>,
    pub created_at: i64,
}

impl ResultRecord {
    pub fn is_determinate(&self) -> bool {
        is_determinate(self.detected, self.confidence, self.error.as_deref())
    }
}

fn is_determinate(detected: Detected, confidence: Option<f64>, error: Option<&str>) -> bool {
    detected != Detected::Unknown && confidence.is_some() && error.is_none()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Inserted,
    Duplicate,
}

/// One unit of work: a (case, category) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkItem {
    pub case_id: String,
    pub category: Category,
}

impl WorkItem {
    pub fn new(case_id: impl Into<String>, category: Category) -> Self {
        Self {
            case_id: case_id.into(),
            category,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub case_id: Option<String>,
    pub category: Option<Category>,
    pub detected: Option<Detected>,
    pub errors_only: bool,
    pub limit: Option<usize>,
}

impl ResultFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn detected(mut self, detected: Detected) -> Self {
        self.detected = Some(detected);
        self
    }

    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Clone, Debug)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        experiment_id: &str,
        case_id: &str,
        category: &Category,
        outcome: &Outcome,
    ) -> Result<RecordStatus, StoreError> {
        let experiment_id = experiment_id.to_string();
        let case_id = case_id.to_string();
        let category = category.clone();
        let outcome = outcome.clone();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = now_epoch_ms();
                let inserted = tx.execute(
                    "INSERT INTO results (experiment_id, case_id, category, detected, confidence, \
                     raw_output, error, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(experiment_id, case_id, category) DO NOTHING",
                    params![
                        experiment_id,
                        case_id,
                        category.as_str(),
                        outcome.detected.as_str(),
                        outcome.confidence,
                        outcome.raw_output,
                        outcome.error,
                        now,
                    ],
                )?;
                if inserted == 0 {
                    return Ok(RecordStatus::Duplicate);
                }
                experiment::apply_progress(&tx, &experiment_id, 1, now)?;
                tx.commit()?;
                Ok(RecordStatus::Inserted)
            })
            .await
    }

    pub async fn query_completed(
        &self,
        experiment_id: &str,
    ) -> Result<BTreeSet<WorkItem>, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.store
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT case_id, category FROM results WHERE experiment_id = ?1")?;
                let mut rows = stmt.query(params![experiment_id])?;
                let mut completed = BTreeSet::new();
                while let Some(row) = rows.next()? {
                    let category: String = row.get(1)?;
                    completed.insert(WorkItem::new(row.get::<_, String>(0)?, stored_category(&category)?));
                }
                Ok(completed)
            })
            .await
    }

    /// Results ordered by (case_id, category).
    pub async fn query_results(
        &self,
        experiment_id: &str,
        filter: &ResultFilter,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        let experiment_id = experiment_id.to_string();
        let filter = filter.clone();
        self.store
            .call(move |conn| select_results(conn, &experiment_id, &filter))
            .await
    }

    pub async fn count(&self, experiment_id: &str) -> Result<usize, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.store
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM results WHERE experiment_id = ?1",
                    params![experiment_id],
                    |row| row.get(0),
                )?;
                Ok(n.max(0) as usize)
            })
            .await
    }

    pub async fn error_count(&self, experiment_id: &str) -> Result<usize, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.store
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM results WHERE experiment_id = ?1 AND error IS NOT NULL",
                    params![experiment_id],
                    |row| row.get(0),
                )?;
                Ok(n.max(0) as usize)
            })
            .await
    }

    /// Write every result of an experiment as one JSON object per line.
    pub async fn export_jsonl(
        &self,
        experiment_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<usize, StoreError> {
        let experiment_id = experiment_id.to_string();
        let path = path.as_ref().to_path_buf();
        self.store
            .call(move |conn| {
                let results = select_results(conn, &experiment_id, &ResultFilter::all())?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                for record in &results {
                    let line = serde_json::to_string(record)
                        .map_err(|e| StoreError::Serde(e.to_string()))?;
                    writeln!(file, "{line}")?;
                }
                file.flush()?;
                Ok(results.len())
            })
            .await
    }
}

fn select_results(
    conn: &Connection,
    experiment_id: &str,
    filter: &ResultFilter,
) -> Result<Vec<ResultRecord>, StoreError> {
    let mut sql = String::from(
        "SELECT experiment_id, case_id, category, detected, confidence, raw_output, error, created_at \
         FROM results WHERE experiment_id = ?1",
    );
    let mut args: Vec<rusqlite::types::Value> = vec![experiment_id.to_string().into()];
    if let Some(case_id) = &filter.case_id {
        args.push(case_id.clone().into());
        sql.push_str(&format!(" AND case_id = ?{}", args.len()));
    }
    if let Some(category) = &filter.category {
        args.push(category.as_str().to_string().into());
        sql.push_str(&format!(" AND category = ?{}", args.len()));
    }
    if let Some(detected) = filter.detected {
        args.push(detected.as_str().to_string().into());
        sql.push_str(&format!(" AND detected = ?{}", args.len()));
    }
    if filter.errors_only {
        sql.push_str(" AND error IS NOT NULL");
    }
    sql.push_str(" ORDER BY case_id, category");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(args))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let category: String = row.get(2)?;
        let detected: String = row.get(3)?;
        results.push(ResultRecord {
            experiment_id: row.get(0)?,
            case_id: row.get(1)?,
            category: stored_category(&category)?,
            detected: Detected::parse(&detected)
                .ok_or_else(|| StoreError::Serde(format!("unknown detected value {detected:?}")))?,
            confidence: row.get(4)?,
            raw_output: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
        });
    }
    Ok(results)
}

fn stored_category(raw: &str) -> Result<Category, StoreError> {
    Category::new(raw).map_err(|e| StoreError::Serde(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_builder_clamps_and_drops_nan() {
        let clamped = Outcome::detected(true).confidence(1.7);
        assert_eq!(clamped.confidence, Some(1.0));
        let dropped = Outcome::detected(true).confidence(f64::NAN);
        assert_eq!(dropped.confidence, None);
        assert!(!dropped.is_determinate());
    }

    #[test]
    fn failed_outcome_is_not_determinate() {
        let outcome = Outcome::failed("timeout").confidence(0.9);
        assert_eq!(outcome.detected, Detected::Unknown);
        assert!(!outcome.is_determinate());
        let errored = Outcome::detected(false).confidence(0.2).error("malformed");
        assert!(!errored.is_determinate());
    }

    #[test]
    fn detected_round_trips_through_storage_text() {
        for d in [Detected::Yes, Detected::No, Detected::Unknown] {
            assert_eq!(Detected::parse(d.as_str()), Some(d));
        }
        assert_eq!(Detected::parse("maybe"), None);
        assert_eq!(
            serde_json::to_string(&Detected::Yes).unwrap(),
            "\"true\""
        );
    }

    #[tokio::test]
    async fn unknown_stored_detected_value_is_an_error() {
        use crate::checksum::Fingerprint;
        use crate::experiment::{ExperimentStore, NewExperiment};

        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("ledger.sqlite")).unwrap();
        ExperimentStore::new(store.clone())
            .create(NewExperiment {
                id: "e1".into(),
                configuration_fingerprint: "cfg".into(),
                dataset_checksum: Fingerprint::from_hex("abc"),
                total_items: 1,
            })
            .await
            .unwrap();
        let ledger = Ledger::new(store.clone());
        let violence = Category::new("violence").unwrap();
        ledger
            .record("e1", "c1", &violence, &Outcome::detected(true).confidence(0.9))
            .await
            .unwrap();
        store
            .with_conn(|conn| conn.execute("UPDATE results SET detected = 'maybe'", []))
            .unwrap();

        let err = ledger
            .query_results("e1", &ResultFilter::all())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Serde(_)), "{err}");
    }
}
