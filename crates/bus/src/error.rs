use thiserror::Error;

/// Errors that can occur in the messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker unreachable or credentials rejected. Fatal at startup.
    #[error("connection error: {0}")]
    Connection(String),

    /// A message that does not follow the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no reply after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// The broker refused an operation (unknown queue, exclusive queue in use, ...).
    #[error("broker error: {0}")]
    Broker(String),

    /// A serve/listen handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl BusError {
    /// The message itself is unusable; redelivering it cannot help.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Json(_) | Self::Deserialization(_)
        )
    }
}
