use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{reconcile, CanonicalStatus};

/// A job as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub title: String,
    #[serde(rename = "artistID")]
    pub artist_id: String,
    pub status: CanonicalStatus,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Fresh record for a job whose asset upload is about to start.
    pub fn uploading(id: impl Into<String>, title: impl Into<String>, artist_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist_id: artist_id.into(),
            status: CanonicalStatus::Uploading,
            created_at: Utc::now(),
        }
    }
}

/// Merged view returned to callers: ledger data plus the live engine opinion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub title: String,
    #[serde(rename = "artistID")]
    pub artist_id: String,
    pub status: CanonicalStatus,
    pub remaining_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn merge(record: &JobRecord, engine: Option<&EngineSnapshot>) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            artist_id: record.artist_id.clone(),
            status: reconcile(record.status, engine),
            remaining_secs: engine.map(|e| e.remaining_secs).unwrap_or(0),
            created_at: record.created_at,
        }
    }
}

// ── Engine view ───────────────────────────────────────────────

/// One render layer of a job inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLayer {
    /// Raw engine status code (0..=200).
    pub status: i64,
    /// Remaining render time estimate; the engine reports negatives when unknown.
    pub remaining_secs: i64,
    pub disabled: bool,
}

/// Aggregated engine state for a job across all of its layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Raw status of the least advanced layer, `None` when the engine has no layers.
    pub status: Option<i64>,
    pub remaining_secs: u64,
    pub disabled: bool,
}

impl EngineSnapshot {
    pub fn from_layers(layers: &[EngineLayer]) -> Self {
        Self {
            status: layers.iter().map(|l| l.status).min(),
            remaining_secs: layers
                .iter()
                .map(|l| l.remaining_secs.max(0) as u64)
                .sum(),
            disabled: layers.iter().any(|l| l.disabled),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
    }
}
