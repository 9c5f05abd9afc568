use std::sync::Arc;

use async_trait::async_trait;
use renderflow_bus::{BusError, Delivery, MessagingClient, Worker};
use renderflow_core::{CanonicalStatus, EngineState, StorageLayout};
use tracing::{debug, info, instrument, warn};

use super::announce_status;
use crate::collaborators::{Archiver, BlobStore};
use crate::contracts::payloads::decode_as;
use crate::contracts::{topics, StatusUpdate};
use crate::error::ServiceError;

/// Packs the rendered images of a finished job and offers them for download.
///
/// Only the engine's final code starts packaging; the post-render script
/// code also reads as `FINISHED` but arrives before the images are final,
/// and packing on both would announce the download twice.
#[derive(Clone)]
pub struct PackageWorker {
    client: Arc<MessagingClient>,
    blobs: Arc<dyn BlobStore>,
    archiver: Arc<dyn Archiver>,
    layout: StorageLayout,
}

impl PackageWorker {
    pub fn new(
        client: Arc<MessagingClient>,
        blobs: Arc<dyn BlobStore>,
        archiver: Arc<dyn Archiver>,
        layout: StorageLayout,
    ) -> Self {
        Self {
            client,
            blobs,
            archiver,
            layout,
        }
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), ServiceError> {
        self.client.acknowledge(&delivery).await?;
        let update: StatusUpdate = decode_as(&delivery.envelope)?;
        if update.is_from(self.client.service_name()) {
            debug!(renderjob_id = %update.renderjob_id, "ignoring own status update");
            return Ok(());
        }
        if update.status != EngineState::Finished.code() {
            return Ok(());
        }
        let Some(artist_id) = update.artist_id.clone() else {
            return Err(ServiceError::Protocol(format!(
                "finished update for {} without artistID",
                update.renderjob_id
            )));
        };

        let outcome = match update.imgdir_part.as_deref() {
            Some(part) if !part.trim().is_empty() => self.package(&update.renderjob_id, &artist_id, part).await,
            _ => Err(ServiceError::DomainValidation("no image directory given".into())),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(renderjob_id = %update.renderjob_id, error = %e, "packaging failed");
                announce_status(&self.client, &update.renderjob_id, &artist_id, CanonicalStatus::Error)
                    .await
            }
        }
    }

    #[instrument(skip(self))]
    async fn package(&self, renderjob_id: &str, artist_id: &str, imgdir_part: &str) -> Result<(), ServiceError> {
        announce_status(&self.client, renderjob_id, artist_id, CanonicalStatus::PreparingDownload).await?;

        let images = self.layout.images_dir(artist_id, renderjob_id, imgdir_part);
        if !tokio::fs::try_exists(&images).await? {
            return Err(ServiceError::DomainValidation(format!(
                "image directory {} does not exist",
                images.display()
            )));
        }
        let packed = self.archiver.pack(&images).await?;

        let location = self.layout.download_location(artist_id, renderjob_id);
        if !self.blobs.bucket_exists(&location.bucket).await? {
            self.blobs.create_bucket(&location.bucket).await?;
        }
        let size = packed.len();
        self.blobs.put(&location, packed).await?;
        info!(%location, size, "download packaged");

        announce_status(&self.client, renderjob_id, artist_id, CanonicalStatus::Downloadable).await
    }
}

#[async_trait]
impl Worker for PackageWorker {
    async fn start(&self) -> Result<(), BusError> {
        let worker = self.clone();
        self.client
            .listen(&topics::status_update(), move |delivery| {
                let worker = worker.clone();
                async move { worker.handle(delivery).await.map_err(BusError::from) }
            })
            .await
    }

    async fn stop(&self) -> Result<(), BusError> {
        info!("package worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "package-worker"
    }
}
