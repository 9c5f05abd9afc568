use std::sync::Arc;

use async_trait::async_trait;
use renderflow_bus::{BusError, Delivery, MessagingClient, Worker};
use renderflow_core::command::SubmitCommand;
use renderflow_core::{CanonicalStatus, JobKind, ManifestRule};
use tracing::{debug, info, instrument, warn};

use super::announce_status;
use crate::collaborators::Ledger;
use crate::contracts::payloads::decode_as;
use crate::contracts::{topics, SubmitReply, SubmitSend, TransitionFinished};
use crate::error::ServiceError;

/// Hands a staged job to the render engine through the execution proxy.
#[derive(Clone)]
pub struct EngineSubmitWorker {
    client: Arc<MessagingClient>,
    ledger: Arc<dyn Ledger>,
    kind: JobKind,
}

impl EngineSubmitWorker {
    pub fn new(client: Arc<MessagingClient>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            client,
            ledger,
            kind: JobKind::default(),
        }
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), ServiceError> {
        // Taken on receipt: a failure past this point is reported, not redelivered.
        self.client.acknowledge(&delivery).await?;
        let staged: TransitionFinished = decode_as(&delivery.envelope)?;
        if let Err(e) = self.submit(&staged).await {
            warn!(renderjob_id = %staged.renderjob_id, error = %e, "engine submission failed");
            self.ledger
                .update_status(&staged.renderjob_id, CanonicalStatus::Error)
                .await?;
            announce_status(
                &self.client,
                &staged.renderjob_id,
                &staged.artist_id,
                CanonicalStatus::Error,
            )
            .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(renderjob_id = %staged.renderjob_id))]
    async fn submit(&self, staged: &TransitionFinished) -> Result<(), ServiceError> {
        let description = self.kind.rule().validate(&staged.relative_file_paths)?;
        debug!(
            base = %staged.renderjob_base_path,
            submitter = %staged.rr_path,
            %description,
            "manifest accepted"
        );

        let command = SubmitCommand::new(&description, &staged.artist_id, &staged.renderjob_id);
        let request = SubmitSend {
            command_options: Some(command.render()),
        };
        let reply: SubmitReply = self.client.call_json(&topics::submit_send(), &request).await?;

        if let Some(failure) = reply.failure() {
            return Err(ServiceError::ExternalCall(failure));
        }
        info!(stdout = %reply.stdout.trim(), "job submitted to engine");
        Ok(())
    }
}

#[async_trait]
impl Worker for EngineSubmitWorker {
    async fn start(&self) -> Result<(), BusError> {
        let worker = self.clone();
        self.client
            .listen(&topics::transition_finished(), move |delivery| {
                let worker = worker.clone();
                async move { worker.handle(delivery).await.map_err(BusError::from) }
            })
            .await
    }

    async fn stop(&self) -> Result<(), BusError> {
        info!("engine submit worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "engine-submit-worker"
    }
}
