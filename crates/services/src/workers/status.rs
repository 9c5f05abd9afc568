use std::sync::Arc;

use async_trait::async_trait;
use renderflow_bus::{BusError, Delivery, MessagingClient, Worker};
use renderflow_core::advance;
use tracing::{debug, info, warn};

use crate::collaborators::Ledger;
use crate::contracts::payloads::decode_as;
use crate::contracts::{topics, StatusUpdate};
use crate::error::ServiceError;

/// Applies status updates from other services to the ledger.
///
/// Applied updates are never republished.
#[derive(Clone)]
pub struct StatusWorker {
    client: Arc<MessagingClient>,
    ledger: Arc<dyn Ledger>,
}

impl StatusWorker {
    pub fn new(client: Arc<MessagingClient>, ledger: Arc<dyn Ledger>) -> Self {
        Self { client, ledger }
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), ServiceError> {
        // Taken on receipt: a failure past this point is reported, not redelivered.
        self.client.acknowledge(&delivery).await?;
        let update: StatusUpdate = decode_as(&delivery.envelope)?;
        if update.is_from(self.client.service_name()) {
            debug!(renderjob_id = %update.renderjob_id, "ignoring own status update");
            return Ok(());
        }
        let Some(incoming) = update.canonical() else {
            debug!(
                renderjob_id = %update.renderjob_id,
                raw = update.status,
                "status without canonical meaning"
            );
            return Ok(());
        };

        let Some(record) = self.ledger.get(&update.renderjob_id).await? else {
            warn!(renderjob_id = %update.renderjob_id, "status update for unknown job dropped");
            return Ok(());
        };

        let next = advance(record.status, incoming);
        if next == record.status {
            debug!(renderjob_id = %record.id, current = %record.status, %incoming, "status unchanged");
            return Ok(());
        }
        self.ledger.update_status(&record.id, next).await?;
        info!(
            renderjob_id = %record.id,
            from = %record.status,
            to = %next,
            initiator = %update.initiator,
            "ledger status advanced"
        );
        Ok(())
    }
}

#[async_trait]
impl Worker for StatusWorker {
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
        info!("status worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "status-worker"
    }
}
