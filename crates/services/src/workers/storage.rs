use std::sync::Arc;

use async_trait::async_trait;
use renderflow_bus::{BusError, Delivery, MessagingClient, Worker};
use renderflow_core::StorageLayout;
use tracing::{info, warn};

use crate::collaborators::BlobStore;
use crate::contracts::payloads::decode_as;
use crate::contracts::{topics, StorageDescriptor, StorageReply, StorageRequest};
use crate::error::ServiceError;

/// Allocates the blob location a new job's asset is uploaded to.
#[derive(Clone)]
pub struct StorageWorker {
    client: Arc<MessagingClient>,
    blobs: Arc<dyn BlobStore>,
    layout: StorageLayout,
}

impl StorageWorker {
    pub fn new(client: Arc<MessagingClient>, blobs: Arc<dyn BlobStore>, layout: StorageLayout) -> Self {
        Self {
            client,
            blobs,
            layout,
        }
    }

    async fn handle(&self, delivery: Delivery) -> Result<StorageReply, ServiceError> {
        let request: StorageRequest = decode_as(&delivery.envelope)?;
        match self.allocate(&request).await {
            Ok(descriptor) => Ok(StorageReply::Allocated(descriptor)),
            Err(e) => {
                warn!(
                    renderjob_id = %request.renderjob_id,
                    artist_id = %request.artist_id,
                    error = %e,
                    "storage allocation refused"
                );
                Ok(StorageReply::Refused {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Ensure the artist bucket exists and the job has no asset yet.
    pub async fn allocate(&self, request: &StorageRequest) -> Result<StorageDescriptor, ServiceError> {
        let location = self
            .layout
            .asset_location(&request.artist_id, &request.renderjob_id);

        if !self.blobs.bucket_exists(&location.bucket).await? {
            self.blobs.create_bucket(&location.bucket).await?;
            info!(bucket = %location.bucket, "artist bucket created");
        } else if self.blobs.stat(&location).await?.is_some() {
            return Err(ServiceError::Storage(format!(
                "renderjob {} already exists",
                request.renderjob_id
            )));
        }

        info!(%location, renderjob_id = %request.renderjob_id, "storage allocated");
        Ok(StorageDescriptor {
            bucket: location.bucket,
            object_name: location.object,
            renderjob_id: request.renderjob_id.clone(),
            artist_id: request.artist_id.clone(),
        })
    }
}

#[async_trait]
impl Worker for StorageWorker {
    async fn start(&self) -> Result<(), BusError> {
        let worker = self.clone();
        self.client
            .serve(&topics::upload_requested(), move |delivery| {
                let worker = worker.clone();
                async move { worker.handle(delivery).await.map_err(BusError::from) }
            })
            .await
    }

    async fn stop(&self) -> Result<(), BusError> {
        info!("storage worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "storage-worker"
    }
}
