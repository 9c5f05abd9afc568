//! Contracts of the systems the choreography talks to but does not own.
//!
//! The node binary wires local implementations (see [`crate::blob`],
//! [`crate::bundle`], [`crate::rewrite`], [`crate::executor`] and
//! [`crate::memory`]); deployments may plug in their own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use renderflow_core::{BlobLocation, CanonicalStatus, EngineSnapshot, JobRecord};

use crate::error::ServiceError;

/// Resolves a caller token to the artist it belongs to.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Returns the subject id. Any failure is [`ServiceError::Unauthorized`].
    async fn verify(&self, token: &str) -> Result<String, ServiceError>;
}

/// Persistent job records, writable by any service.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create(&self, record: JobRecord) -> Result<JobRecord, ServiceError>;

    async fn get(&self, renderjob_id: &str) -> Result<Option<JobRecord>, ServiceError>;

    async fn update_status(
        &self,
        renderjob_id: &str,
        status: CanonicalStatus,
    ) -> Result<JobRecord, ServiceError>;

    async fn update_title(&self, renderjob_id: &str, title: &str) -> Result<JobRecord, ServiceError>;

    async fn find_by_artist(&self, artist_id: &str) -> Result<Vec<JobRecord>, ServiceError>;
}

/// The render farm as seen from the job service.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Live state across all layers of a job; empty when the engine does not know it.
    async fn snapshot(&self, renderjob_id: &str) -> Result<EngineSnapshot, ServiceError>;

    async fn disable(&self, renderjob_id: &str) -> Result<(), ServiceError>;
}

/// Bucketed object storage for uploaded assets and packaged results.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ServiceError>;

    async fn create_bucket(&self, bucket: &str) -> Result<(), ServiceError>;

    async fn put(&self, location: &BlobLocation, data: Bytes) -> Result<(), ServiceError>;

    async fn get(&self, location: &BlobLocation) -> Result<Bytes, ServiceError>;

    /// Size of the object, `None` when it does not exist.
    async fn stat(&self, location: &BlobLocation) -> Result<Option<u64>, ServiceError>;
}

/// Turns a directory into one blob and back.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn pack(&self, dir: &Path) -> Result<Bytes, ServiceError>;

    /// Unpack below `dest`, returning the relative paths of every entry.
    async fn unpack(&self, data: Bytes, dest: &Path) -> Result<Vec<String>, ServiceError>;
}

/// Points the staged job description at the job's engine-visible location.
#[async_trait]
pub trait DescriptionRewriter: Send + Sync {
    /// Rewrite the description inside `job_dir`, returning the file touched.
    async fn rewrite(&self, job_dir: &Path, workspace_path: &str) -> Result<PathBuf, ServiceError>;
}

/// Output of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when the command could not be run or exited unsuccessfully.
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput;
}
