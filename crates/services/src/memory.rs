//! In-memory collaborators for single-process nodes and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use renderflow_core::{BlobLocation, CanonicalStatus, EngineLayer, EngineSnapshot, JobRecord};

use crate::collaborators::{BlobStore, Engine, IdentityVerifier, Ledger};
use crate::error::ServiceError;

// ── Ledger ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create(&self, record: JobRecord) -> Result<JobRecord, ServiceError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(ServiceError::Ledger(format!("job {} already exists", record.id)));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, renderjob_id: &str) -> Result<Option<JobRecord>, ServiceError> {
        Ok(self.records.read().await.get(renderjob_id).cloned())
    }

    async fn update_status(
        &self,
        renderjob_id: &str,
        status: CanonicalStatus,
    ) -> Result<JobRecord, ServiceError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(renderjob_id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {renderjob_id}")))?;
        record.status = status;
        Ok(record.clone())
    }

    async fn update_title(&self, renderjob_id: &str, title: &str) -> Result<JobRecord, ServiceError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(renderjob_id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {renderjob_id}")))?;
        record.title = title.to_string();
        Ok(record.clone())
    }

    async fn find_by_artist(&self, artist_id: &str) -> Result<Vec<JobRecord>, ServiceError> {
        let mut found: Vec<JobRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.artist_id == artist_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Engine double holding the render layers of each job.
#[derive(Default)]
pub struct MemoryEngine {
    jobs: RwLock<HashMap<String, Vec<EngineLayer>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_layers(&self, renderjob_id: &str, layers: Vec<EngineLayer>) {
        self.jobs.write().await.insert(renderjob_id.to_string(), layers);
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn snapshot(&self, renderjob_id: &str) -> Result<EngineSnapshot, ServiceError> {
        let jobs = self.jobs.read().await;
        let layers = jobs.get(renderjob_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(EngineSnapshot::from_layers(layers))
    }

    async fn disable(&self, renderjob_id: &str) -> Result<(), ServiceError> {
        let mut jobs = self.jobs.write().await;
        let layers = jobs
            .get_mut(renderjob_id)
            .ok_or_else(|| ServiceError::NotFound(format!("engine job {renderjob_id}")))?;
        for layer in layers.iter_mut() {
            layer.disabled = true;
        }
        Ok(())
    }
}

// ── Blob store ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBlobStore {
    buckets: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ServiceError> {
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), ServiceError> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn put(&self, location: &BlobLocation, data: Bytes) -> Result<(), ServiceError> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .get_mut(&location.bucket)
            .ok_or_else(|| ServiceError::Storage(format!("no such bucket: {}", location.bucket)))?;
        bucket.insert(location.object.clone(), data);
        Ok(())
    }

    async fn get(&self, location: &BlobLocation) -> Result<Bytes, ServiceError> {
        self.buckets
            .read()
            .await
            .get(&location.bucket)
            .and_then(|b| b.get(&location.object))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("object {location}")))
    }

    async fn stat(&self, location: &BlobLocation) -> Result<Option<u64>, ServiceError> {
        Ok(self
            .buckets
            .read()
            .await
            .get(&location.bucket)
            .and_then(|b| b.get(&location.object))
            .map(|data| data.len() as u64))
    }
}

// ── Identity ─────────────────────────────────────────────────────────

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, String>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), subject.into());
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentity {
    async fn verify(&self, token: &str) -> Result<String, ServiceError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| ServiceError::Unauthorized("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ledger_rejects_duplicate_ids() {
        let ledger = MemoryLedger::new();
        ledger
            .create(JobRecord::uploading("R1", "shot_010", "A1"))
            .await
            .unwrap();
        let err = ledger
            .create(JobRecord::uploading("R1", "other", "A1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Ledger(_)));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn ledger_updates_and_filters_by_artist() {
        let ledger = MemoryLedger::new();
        for (id, artist) in [("R1", "A1"), ("R2", "A2"), ("R3", "A1")] {
            ledger
                .create(JobRecord::uploading(id, "t", artist))
                .await
                .unwrap();
        }
        ledger
            .update_status("R3", CanonicalStatus::Submitting)
            .await
            .unwrap();
        ledger.update_title("R1", "renamed").await.unwrap();

        let mine = ledger.find_by_artist("A1").await.unwrap();
        let ids: Vec<&str> = mine.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"R1") && ids.contains(&"R3"));
        assert_eq!(ledger.get("R1").await.unwrap().unwrap().title, "renamed");
        assert_eq!(
            ledger.get("R3").await.unwrap().unwrap().status,
            CanonicalStatus::Submitting
        );

        let err = ledger
            .update_status("missing", CanonicalStatus::Error)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn engine_disable_marks_every_layer() {
        let engine = MemoryEngine::new();
        let layer = EngineLayer {
            status: 120,
            remaining_secs: 30,
            disabled: false,
        };
        engine.set_layers("R1", vec![layer, layer]).await;

        engine.disable("R1").await.unwrap();
        assert!(engine.snapshot("R1").await.unwrap().disabled);
        assert!(engine.snapshot("R2").await.unwrap().is_empty());
        assert!(engine.disable("R2").await.is_err());
    }

    #[tokio::test]
    async fn blob_put_requires_bucket() {
        let blobs = MemoryBlobStore::new();
        let loc = BlobLocation {
            bucket: "a1".into(),
            object: "R1.zip".into(),
        };
        assert!(blobs.put(&loc, Bytes::from_static(b"x")).await.is_err());

        blobs.create_bucket("a1").await.unwrap();
        assert!(blobs.bucket_exists("a1").await.unwrap());
        assert_eq!(blobs.stat(&loc).await.unwrap(), None);
        blobs.put(&loc, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(blobs.stat(&loc).await.unwrap(), Some(3));
        assert_eq!(blobs.get(&loc).await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn static_identity_rejects_unknown_tokens() {
        let identity = StaticIdentity::new().with_token("t1", "A1");
        assert_eq!(identity.verify("t1").await.unwrap(), "A1");
        assert!(matches!(
            identity.verify("t2").await,
            Err(ServiceError::Unauthorized(_))
        ));
    }
}
