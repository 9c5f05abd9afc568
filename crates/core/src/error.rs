use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The unpacked asset does not satisfy the manifest rule set for its kind.
    #[error("manifest rejected: {0}")]
    Manifest(String),

    #[error("unknown status code: {0}")]
    UnknownStatus(i64),

    #[error("invalid status value: {0:?}")]
    InvalidStatus(String),

    #[error("path error: {0}")]
    Path(String),

    #[error("{0}")]
    Other(String),
}
