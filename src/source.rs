//! Immutable source records, stored once per dataset fingerprint.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::checksum::{self, Fingerprint};
use crate::store::{now_epoch_ms, Store, StoreError};

// =============================================================================
// Types
// =============================================================================

/// A classification dimension processed independently per case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Category(String);

impl Category {
    pub fn new(raw: &str) -> Result<Self, SourceError> {
        let normalized = raw.trim().to_lowercase();
        let valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(SourceError::InvalidCategory(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Category {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Category {
    type Error = SourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRecord {
    pub case_id: String,
    pub category: Category,
    pub text: Option<String>,
    pub checksum: String,
}

impl SourceRecord {
    pub fn new(
        case_id: impl Into<String>,
        category: Category,
        text: Option<String>,
    ) -> Result<Self, SourceError> {
        let case_id = case_id.into().trim().to_string();
        if case_id.is_empty() {
            return Err(SourceError::EmptyCaseId);
        }
        let checksum = checksum::record_checksum(&case_id, category.as_str(), text.as_deref());
        Ok(Self {
            case_id,
            category,
            text,
            checksum,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub checksum: Fingerprint,
    pub origin: String,
    pub record_count: usize,
    pub loaded_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub checksum: Fingerprint,
    pub count: usize,
    /// False when the dataset was already stored and the load short-circuited.
    pub newly_loaded: bool,
}

/// Filter for [`SourceStore::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    pub dataset: Option<Fingerprint>,
    pub categories: Option<Vec<Category>>,
    pub case_ids: Option<Vec<String>>,
    pub has_text: Option<bool>,
}

impl SourceFilter {
    pub fn dataset(checksum: &Fingerprint) -> Self {
        Self {
            dataset: Some(checksum.clone()),
            ..Default::default()
        }
    }

    pub fn categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    pub fn case_ids(mut self, case_ids: impl IntoIterator<Item = String>) -> Self {
        self.case_ids = Some(case_ids.into_iter().collect());
        self
    }

    pub fn has_text(mut self, has_text: bool) -> Self {
        self.has_text = Some(has_text);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid category: {0:?}")]
    InvalidCategory(String),
    #[error("empty case_id")]
    EmptyCaseId,
    #[error("duplicate record for case {case_id} / {category}")]
    DuplicateKey { case_id: String, category: Category },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for SourceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

// =============================================================================
// Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawRecord {
    case_id: String,
    category: String,
    #[serde(default)]
    text: Option<String>,
}

/// Read a JSONL dataset (`{"case_id", "category", "text"}` per line).
pub fn read_dataset(path: impl AsRef<Path>) -> Result<Vec<SourceRecord>, SourceError> {
    let raw = std::fs::read_to_string(path)?;
    parse_dataset(&raw)
}

pub fn parse_dataset(raw: &str) -> Result<Vec<SourceRecord>, SourceError> {
    let mut records = Vec::new();
    let mut seen: HashSet<(String, Category)> = HashSet::new();
    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: RawRecord = serde_json::from_str(line).map_err(|e| SourceError::Parse {
            line: line_no,
            message: e.to_string(),
        })?;
        let category = Category::new(&parsed.category).map_err(|e| SourceError::Parse {
            line: line_no,
            message: e.to_string(),
        })?;
        let record = SourceRecord::new(parsed.case_id, category, parsed.text).map_err(|e| {
            SourceError::Parse {
                line: line_no,
                message: e.to_string(),
            }
        })?;
        if !seen.insert((record.case_id.clone(), record.category.clone())) {
            return Err(SourceError::DuplicateKey {
                case_id: record.case_id,
                category: record.category,
            });
        }
        records.push(record);
    }
    Ok(records)
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone, Debug)]
pub struct SourceStore {
    store: Store,
}

impl SourceStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Load a JSONL file. Loading the same content twice does not duplicate
    /// records: a stored fingerprint short-circuits the write.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<LoadReport, SourceError> {
        let path = path.as_ref();
        let records = read_dataset(path)?;
        self.load_records(&path.display().to_string(), records).await
    }

    pub async fn load_records(
        &self,
        origin: &str,
        records: Vec<SourceRecord>,
    ) -> Result<LoadReport, SourceError> {
        let checksum = checksum::compute(&records);
        let origin = origin.to_string();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(existing) = dataset_row(&tx, &checksum)? {
                    return Ok(LoadReport {
                        checksum,
                        count: existing.record_count,
                        newly_loaded: false,
                    });
                }
                tx.execute(
                    "INSERT INTO datasets (checksum, origin, record_count, loaded_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![checksum.as_str(), origin, records.len() as i64, now_epoch_ms()],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO source_records \
                         (dataset_checksum, case_id, category, text, record_checksum) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for record in &records {
                        stmt.execute(params![
                            checksum.as_str(),
                            record.case_id,
                            record.category.as_str(),
                            record.text,
                            record.checksum,
                        ])?;
                    }
                }
                tx.commit()?;
                tracing::info!(
                    dataset = checksum.short(),
                    records = records.len(),
                    "loaded source dataset"
                );
                Ok(LoadReport {
                    checksum,
                    count: records.len(),
                    newly_loaded: true,
                })
            })
            .await
    }

    pub async fn dataset(&self, checksum: &Fingerprint) -> Result<Option<DatasetInfo>, SourceError> {
        let checksum = checksum.clone();
        self.store
            .call(move |conn| dataset_row(conn, &checksum))
            .await
    }

    /// Records matching `filter`, ordered by (case_id, category).
    pub async fn query(
        &self,
        filter: &SourceFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let filter = filter.clone();
        self.store
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT case_id, category, text, record_checksum FROM source_records WHERE 1 = 1",
                );
                let mut args: Vec<rusqlite::types::Value> = Vec::new();
                if let Some(dataset) = &filter.dataset {
                    args.push(dataset.as_str().to_string().into());
                    sql.push_str(&format!(" AND dataset_checksum = ?{}", args.len()));
                }
                if let Some(categories) = &filter.categories {
                    push_in_clause(
                        &mut sql,
                        &mut args,
                        "category",
                        categories.iter().map(|c| c.as_str().to_string()),
                    );
                }
                if let Some(case_ids) = &filter.case_ids {
                    push_in_clause(&mut sql, &mut args, "case_id", case_ids.iter().cloned());
                }
                match filter.has_text {
                    Some(true) => sql.push_str(" AND text IS NOT NULL"),
                    Some(false) => sql.push_str(" AND text IS NULL"),
                    None => {}
                }
                sql.push_str(" ORDER BY case_id, category");
                if let Some(limit) = limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(args))?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    let category: String = row.get(1)?;
                    records.push(SourceRecord {
                        case_id: row.get(0)?,
                        category: Category::new(&category)?,
                        text: row.get(2)?,
                        checksum: row.get(3)?,
                    });
                }
                Ok(records)
            })
            .await
    }
}

fn push_in_clause(
    sql: &mut String,
    args: &mut Vec<rusqlite::types::Value>,
    column: &str,
    values: impl Iterator<Item = String>,
) {
    let mut placeholders = Vec::new();
    for value in values {
        args.push(value.into());
        placeholders.push(format!("?{}", args.len()));
    }
    if placeholders.is_empty() {
        sql.push_str(" AND 0 = 1");
    } else {
        sql.push_str(&format!(" AND {column} IN ({})", placeholders.join(", ")));
    }
}

fn dataset_row(
    conn: &Connection,
    checksum: &Fingerprint,
) -> Result<Option<DatasetInfo>, SourceError> {
    let row = conn
        .query_row(
            "SELECT checksum, origin, record_count, loaded_at FROM datasets WHERE checksum = ?1",
            params![checksum.as_str()],
            |row| {
                Ok(DatasetInfo {
                    checksum: Fingerprint::from_hex(row.get::<_, String>(0)?),
                    origin: row.get(1)?,
                    record_count: row.get::<_, i64>(2)?.max(0) as usize,
                    loaded_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_normalizes_case_and_whitespace() {
        let category = Category::new("  Fatigue ").unwrap();
        assert_eq!(category.as_str(), "fatigue");
        assert!(Category::new("two words").is_err());
        assert!(Category::new("").is_err());
    }

    #[test]
    fn parse_dataset_reports_line_numbers() {
        let raw = "{\"case_id\":\"c1\",\"category\":\"fatigue\",\"text\":\"x\"}\n\nnot json\n";
        match parse_dataset(raw) {
            Err(SourceError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn parse_dataset_rejects_duplicate_keys() {
        let raw = "{\"case_id\":\"c1\",\"category\":\"fatigue\",\"text\":\"x\"}\n\
                   {\"case_id\":\"c1\",\"category\":\"FATIGUE\",\"text\":\"y\"}\n";
        assert!(matches!(
            parse_dataset(raw),
            Err(SourceError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn parse_dataset_keeps_null_text() {
        let raw = "{\"case_id\":\"c1\",\"category\":\"fatigue\",\"text\":null}\n\
                   {\"case_id\":\"c2\",\"category\":\"fatigue\"}\n";
        let records = parse_dataset(raw).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.text.is_none()));
    }
}
