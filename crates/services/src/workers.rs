//! One worker per pipeline step.
//!
//! | worker | service | consumes |
//! |---|---|---|
//! | [`StorageWorker`] | Files | RPC `renderjob.upload.requested` |
//! | [`TransitionWorker`] | Files | `renderjob.submit.requested` |
//! | [`PackageWorker`] | Files | `renderjob.status.update` |
//! | [`EngineSubmitWorker`] | Jobs | `renderjob.transition.finished` |
//! | [`StatusWorker`] | Jobs | `renderjob.status.update` |
//! | [`ProxyWorker`] | submitProxy | RPC `renderjob.submit.send` |
//!
//! Every worker only registers consumers on its service's client; shutting
//! the client down stops them.

pub mod engine_submit;
pub mod package;
pub mod proxy;
pub mod status;
pub mod storage;
pub mod transition;

pub use engine_submit::EngineSubmitWorker;
pub use package::PackageWorker;
pub use proxy::ProxyWorker;
pub use status::StatusWorker;
pub use storage::StorageWorker;
pub use transition::TransitionWorker;

use renderflow_bus::MessagingClient;
use renderflow_core::CanonicalStatus;
use tracing::{info, warn};

use crate::contracts::{topics, StatusUpdate};
use crate::error::ServiceError;

/// Announce a status change made by this client's service.
pub(crate) async fn announce_status(
    client: &MessagingClient,
    renderjob_id: &str,
    artist_id: &str,
    status: CanonicalStatus,
) -> Result<(), ServiceError> {
    let update = StatusUpdate::new(renderjob_id, artist_id, status, client.service_name());
    let accepted = client.publish(&topics::status_update(), &update).await?;
    if !accepted {
        warn!(renderjob_id, %status, "status update published under backpressure");
    }
    info!(renderjob_id, %status, initiator = %client.service_name(), "status announced");
    Ok(())
}
