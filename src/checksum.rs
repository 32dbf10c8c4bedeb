//! Dataset fingerprints for drift detection between runs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::source::SourceRecord;

/// Hex-encoded blake3 digest of a whole dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Match,
    Mismatch {
        stored: Fingerprint,
        current: Fingerprint,
    },
    /// Nothing was stored yet; `current` is what should be recorded.
    Absent { current: Fingerprint },
}

impl ChecksumStatus {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}

/// Digest of one record's content. Fields are length-prefixed so that moving a
/// character between fields changes the digest, and a null text hashes
/// differently from an empty one.
pub fn record_checksum(case_id: &str, category: &str, text: Option<&str>) -> String {
    let mut hasher = blake3::Hasher::new();
    update_field(&mut hasher, Some(case_id));
    update_field(&mut hasher, Some(category));
    update_field(&mut hasher, text);
    hasher.finalize().to_hex().to_string()
}

fn update_field(hasher: &mut blake3::Hasher, field: Option<&str>) {
    match field {
        Some(value) => {
            hasher.update(&[1u8]);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        None => {
            hasher.update(&[0u8]);
        }
    }
}

/// Fingerprint a dataset. Input order does not matter: records are sorted by
/// (case_id, category) and each one's digest is recomputed from its content.
pub fn compute(dataset: &[SourceRecord]) -> Fingerprint {
    let mut ordered: Vec<&SourceRecord> = dataset.iter().collect();
    ordered.sort_by(|a, b| {
        a.case_id
            .cmp(&b.case_id)
            .then_with(|| a.category.cmp(&b.category))
    });

    let mut hasher = blake3::Hasher::new();
    hasher.update(&(ordered.len() as u64).to_le_bytes());
    for record in ordered {
        let digest = record_checksum(
            &record.case_id,
            record.category.as_str(),
            record.text.as_deref(),
        );
        hasher.update(digest.as_bytes());
    }
    Fingerprint(hasher.finalize().to_hex().to_string())
}

pub fn verify(stored: Option<&Fingerprint>, dataset: &[SourceRecord]) -> ChecksumStatus {
    let current = compute(dataset);
    match stored {
        None => ChecksumStatus::Absent { current },
        Some(stored) if *stored == current => ChecksumStatus::Match,
        Some(stored) => ChecksumStatus::Mismatch {
            stored: stored.clone(),
            current,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_checksum_distinguishes_null_from_empty() {
        assert_ne!(
            record_checksum("c1", "fatigue", None),
            record_checksum("c1", "fatigue", Some(""))
        );
    }

    #[test]
    fn record_checksum_is_field_boundary_aware() {
        assert_ne!(
            record_checksum("c1", "ab", Some("c")),
            record_checksum("c1", "a", Some("bc"))
        );
    }

    #[test]
    fn short_fingerprint_is_prefix() {
        let fp = Fingerprint::from_hex("0123456789abcdef");
        assert_eq!(fp.short(), "0123456789ab");
    }
}
