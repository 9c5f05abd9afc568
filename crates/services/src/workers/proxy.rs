use std::sync::Arc;

use async_trait::async_trait;
use renderflow_bus::{BusError, Delivery, MessagingClient, Worker};
use renderflow_core::command::split_arguments;
use renderflow_core::paths::trim_trailing_slashes;
use tracing::{info, warn};

use crate::collaborators::CommandExecutor;
use crate::contracts::payloads::decode_as;
use crate::contracts::{topics, SubmitReply, SubmitSend};
use crate::error::ServiceError;

/// Runs the engine submitter on behalf of the job service.
#[derive(Clone)]
pub struct ProxyWorker {
    client: Arc<MessagingClient>,
    executor: Arc<dyn CommandExecutor>,
    submitter: String,
    project_base: String,
}

impl ProxyWorker {
    pub fn new(
        client: Arc<MessagingClient>,
        executor: Arc<dyn CommandExecutor>,
        submitter: impl Into<String>,
        project_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            executor,
            submitter: submitter.into(),
            project_base: project_base.into(),
        }
    }

    async fn handle(&self, delivery: Delivery) -> Result<SubmitReply, ServiceError> {
        let request: SubmitSend = decode_as(&delivery.envelope)?;
        let Some(options) = request.command_options.filter(|o| !o.trim().is_empty()) else {
            warn!("submit request without commandOptions");
            return Ok(SubmitReply::failed("missing commandOptions"));
        };

        let line = format!("{}/{}", trim_trailing_slashes(&self.project_base), options);
        let args = split_arguments(&line);
        let reply = SubmitReply::from(self.executor.run(&self.submitter, &args).await);
        match reply.failure() {
            Some(failure) => warn!(submitter = %self.submitter, %failure, "submitter failed"),
            None => info!(submitter = %self.submitter, "submitter finished"),
        }
        Ok(reply)
    }
}

#[async_trait]
impl Worker for ProxyWorker {
    async fn start(&self) -> Result<(), BusError> {
        let worker = self.clone();
        self.client
            .serve(&topics::submit_send(), move |delivery| {
                let worker = worker.clone();
                async move { worker.handle(delivery).await.map_err(BusError::from) }
            })
            .await
    }

    async fn stop(&self) -> Result<(), BusError> {
        info!("proxy worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "proxy-worker"
    }
}
