use renderflow_bus::BusError;
use renderflow_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// A message that does not follow the event contract. Dropped after logging.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Input that is well-formed but not acceptable (manifest, missing image dir).
    #[error("validation failed: {0}")]
    DomainValidation(String),

    /// A collaborator service answered with a failure.
    #[error("external call failed: {0}")]
    ExternalCall(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<object_store::Error> for ServiceError {
    fn from(e: object_store::Error) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<ServiceError> for BusError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Bus(inner) => inner,
            ServiceError::Protocol(msg) => BusError::Protocol(msg),
            other => BusError::Handler(other.to_string()),
        }
    }
}
