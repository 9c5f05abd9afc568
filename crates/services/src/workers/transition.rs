use std::sync::Arc;

use async_trait::async_trait;
use renderflow_bus::{BusError, Delivery, MessagingClient, Worker};
use renderflow_core::{CanonicalStatus, JobKind, ManifestRule, StorageLayout};
use tracing::{info, instrument, warn};

use super::announce_status;
use crate::collaborators::{Archiver, BlobStore, DescriptionRewriter};
use crate::contracts::payloads::decode_as;
use crate::contracts::{topics, SubmitRequested, TransitionFinished};
use crate::error::ServiceError;

/// Stages an uploaded asset on the render share.
///
/// Any failure after decoding ends the job in `ERROR`; nothing else is
/// published for it.
#[derive(Clone)]
pub struct TransitionWorker {
    client: Arc<MessagingClient>,
    blobs: Arc<dyn BlobStore>,
    archiver: Arc<dyn Archiver>,
    rewriter: Arc<dyn DescriptionRewriter>,
    layout: StorageLayout,
    submitter_path: String,
    kind: JobKind,
}

impl TransitionWorker {
    pub fn new(
        client: Arc<MessagingClient>,
        blobs: Arc<dyn BlobStore>,
        archiver: Arc<dyn Archiver>,
        rewriter: Arc<dyn DescriptionRewriter>,
        layout: StorageLayout,
        submitter_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            blobs,
            archiver,
            rewriter,
            layout,
            submitter_path: submitter_path.into(),
            kind: JobKind::default(),
        }
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), ServiceError> {
        let request: SubmitRequested = decode_as(&delivery.envelope)?;
        match self.stage(&request).await {
            Ok(finished) => {
                self.client
                    .publish(&topics::transition_finished(), &finished)
                    .await?;
                info!(
                    renderjob_id = %request.renderjob_id,
                    files = finished.relative_file_paths.len(),
                    "transition finished"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    renderjob_id = %request.renderjob_id,
                    artist_id = %request.artist_id,
                    error = %e,
                    "staging failed"
                );
                announce_status(
                    &self.client,
                    &request.renderjob_id,
                    &request.artist_id,
                    CanonicalStatus::Error,
                )
                .await
            }
        }
    }

    #[instrument(skip_all, fields(renderjob_id = %request.renderjob_id))]
    async fn stage(&self, request: &SubmitRequested) -> Result<TransitionFinished, ServiceError> {
        let location = self
            .layout
            .asset_location(&request.artist_id, &request.renderjob_id);
        if self.blobs.stat(&location).await?.is_none() {
            return Err(ServiceError::NotFound(format!("asset {location}")));
        }

        let job_dir = self.layout.job_dir(&request.artist_id, &request.renderjob_id);
        if tokio::fs::try_exists(&job_dir).await? {
            return Err(ServiceError::DomainValidation(format!(
                "job already staged at {}",
                job_dir.display()
            )));
        }

        let asset = self.blobs.get(&location).await?;
        let mut files = self.archiver.unpack(asset, &job_dir).await?;
        files.sort();

        self.kind.rule().validate(&files)?;

        let engine_path = self
            .layout
            .engine_job_path(&request.artist_id, &request.renderjob_id);
        self.rewriter.rewrite(&job_dir, &engine_path).await?;

        Ok(TransitionFinished {
            renderjob_base_path: engine_path,
            relative_file_paths: files,
            artist_id: request.artist_id.clone(),
            renderjob_id: request.renderjob_id.clone(),
            rr_path: self.submitter_path.clone(),
        })
    }
}

#[async_trait]
impl Worker for TransitionWorker {
    async fn start(&self) -> Result<(), BusError> {
        let worker = self.clone();
        self.client
            .listen(&topics::submit_requested(), move |delivery| {
                let worker = worker.clone();
                async move { worker.handle(delivery).await.map_err(BusError::from) }
            })
            .await
    }

    async fn stop(&self) -> Result<(), BusError> {
        info!("transition worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "transition-worker"
    }
}
