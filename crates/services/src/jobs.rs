//! Job operations offered to the outer API.
//!
//! Every call is made with a caller token; the verified subject is the
//! artist the job must belong to.

use std::sync::Arc;

use renderflow_bus::{MessagingClient, Worker};
use renderflow_core::{CanonicalStatus, EngineSnapshot, Job, JobRecord};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::collaborators::{Engine, IdentityVerifier, Ledger};
use crate::contracts::{topics, StorageDescriptor, StorageReply, StorageRequest, SubmitRequested};
use crate::error::ServiceError;
use crate::workers::{announce_status, EngineSubmitWorker, StatusWorker};

pub struct JobService {
    client: Arc<MessagingClient>,
    ledger: Arc<dyn Ledger>,
    engine: Arc<dyn Engine>,
    identity: Arc<dyn IdentityVerifier>,
}

impl JobService {
    pub fn new(
        client: Arc<MessagingClient>,
        ledger: Arc<dyn Ledger>,
        engine: Arc<dyn Engine>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            client,
            ledger,
            engine,
            identity,
        }
    }

    /// Record a new job and ask the storage service where its asset goes.
    ///
    /// A refused or unanswered allocation leaves the job in `ERROR` and is
    /// returned to the caller.
    #[instrument(skip(self, token))]
    pub async fn create(&self, token: &str, title: &str) -> Result<StorageDescriptor, ServiceError> {
        let artist_id = self.identity.verify(token).await?;
        let renderjob_id = Uuid::new_v4().simple().to_string();
        let record = self
            .ledger
            .create(JobRecord::uploading(&renderjob_id, title, &artist_id))
            .await?;
        info!(renderjob_id = %record.id, artist_id = %record.artist_id, "job created");

        let request = StorageRequest {
            artist_id: artist_id.clone(),
            renderjob_id: renderjob_id.clone(),
        };
        let failure = match self
            .client
            .call_json::<_, StorageReply>(&topics::upload_requested(), &request)
            .await
        {
            Ok(StorageReply::Allocated(descriptor)) => return Ok(descriptor),
            Ok(StorageReply::Refused { error }) => ServiceError::ExternalCall(error),
            Err(e) => ServiceError::Bus(e),
        };

        warn!(renderjob_id = %renderjob_id, error = %failure, "storage allocation failed");
        self.ledger
            .update_status(&renderjob_id, CanonicalStatus::Error)
            .await?;
        Err(failure)
    }

    /// Start staging an uploaded job.
    #[instrument(skip(self, token))]
    pub async fn submit(&self, token: &str, renderjob_id: &str) -> Result<Job, ServiceError> {
        let record = self.owned(token, renderjob_id).await?;
        let record = self
            .ledger
            .update_status(&record.id, CanonicalStatus::Submitting)
            .await?;

        let request = SubmitRequested {
            artist_id: record.artist_id.clone(),
            renderjob_id: record.id.clone(),
        };
        self.client
            .publish(&topics::submit_requested(), &request)
            .await?;
        info!(renderjob_id, "submit requested");
        self.view(&record).await
    }

    /// Stop a job everywhere and mark it `DISABLED`.
    #[instrument(skip(self, token))]
    pub async fn abort(&self, token: &str, renderjob_id: &str) -> Result<Job, ServiceError> {
        let record = self.owned(token, renderjob_id).await?;
        let record = self
            .ledger
            .update_status(&record.id, CanonicalStatus::Disabled)
            .await?;

        let snapshot = self.engine.snapshot(&record.id).await?;
        if !snapshot.is_empty() && !snapshot.disabled {
            self.engine.disable(&record.id).await?;
            info!(renderjob_id, "engine job disabled");
        }

        announce_status(&self.client, &record.id, &record.artist_id, CanonicalStatus::Disabled)
            .await?;
        self.view(&record).await
    }

    pub async fn get(&self, token: &str, renderjob_id: &str) -> Result<Job, ServiceError> {
        let record = self.owned(token, renderjob_id).await?;
        self.view(&record).await
    }

    /// Every job of the calling artist, oldest first.
    pub async fn list_by_artist(&self, token: &str) -> Result<Vec<Job>, ServiceError> {
        let artist_id = self.identity.verify(token).await?;
        let records = self.ledger.find_by_artist(&artist_id).await?;
        let mut jobs = Vec::with_capacity(records.len());
        for record in &records {
            jobs.push(self.view(record).await?);
        }
        Ok(jobs)
    }

    pub async fn update_title(&self, token: &str, renderjob_id: &str, title: &str) -> Result<Job, ServiceError> {
        let record = self.owned(token, renderjob_id).await?;
        let record = self.ledger.update_title(&record.id, title).await?;
        self.view(&record).await
    }

    async fn owned(&self, token: &str, renderjob_id: &str) -> Result<JobRecord, ServiceError> {
        let artist_id = self.identity.verify(token).await?;
        let record = self
            .ledger
            .get(renderjob_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("job {renderjob_id}")))?;
        if record.artist_id != artist_id {
            return Err(ServiceError::Unauthorized(format!(
                "job {renderjob_id} belongs to another artist"
            )));
        }
        Ok(record)
    }

    async fn view(&self, record: &JobRecord) -> Result<Job, ServiceError> {
        let snapshot: EngineSnapshot = self.engine.snapshot(&record.id).await?;
        let engine = (!snapshot.is_empty()).then_some(&snapshot);
        Ok(Job::merge(record, engine))
    }
}

/// The Jobs service as deployed: the job operations plus the workers that
/// keep their ledger current, all sharing one ledger.
pub struct JobsNode {
    service: Arc<JobService>,
    status: Arc<StatusWorker>,
    submit: Arc<EngineSubmitWorker>,
}

impl JobsNode {
    pub fn new(
        client: Arc<MessagingClient>,
        ledger: Arc<dyn Ledger>,
        engine: Arc<dyn Engine>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            status: Arc::new(StatusWorker::new(client.clone(), ledger.clone())),
            submit: Arc::new(EngineSubmitWorker::new(client.clone(), ledger.clone())),
            service: Arc::new(JobService::new(client, ledger, engine, identity)),
        }
    }

    /// Job operations for whatever outer API fronts this node.
    pub fn service(&self) -> Arc<JobService> {
        Arc::clone(&self.service)
    }

    pub fn workers(&self) -> Vec<Arc<dyn Worker>> {
        vec![self.status.clone(), self.submit.clone()]
    }
}
