//! [`BlobStore`] over `object_store`, local filesystem or S3.
//!
//! Buckets are top-level prefixes. A bucket exists once its marker object
//! has been written, so empty buckets survive on stores without directories.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};

use renderflow_core::config::BlobConfig;
use renderflow_core::BlobLocation;

use crate::collaborators::BlobStore;
use crate::error::ServiceError;

const BUCKET_MARKER: &str = "_bucket";

pub struct ObjectStoreBlobs {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobs {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Build the configured backend; `s3` needs `S3_BUCKET`, anything else is local.
    pub fn from_config(config: &BlobConfig) -> Result<Self, ServiceError> {
        match config.backend.as_str() {
            "s3" => Self::s3(config),
            _ => Self::local(&config.local_dir),
        }
    }

    fn local(dir: &std::path::Path) -> Result<Self, ServiceError> {
        std::fs::create_dir_all(dir)?;
        let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)?;
        info!("Blob store: local backend at {}", canonical.display());
        Ok(Self::new(Arc::new(store)))
    }

    fn s3(config: &BlobConfig) -> Result<Self, ServiceError> {
        let bucket = config
            .s3_bucket
            .as_deref()
            .ok_or_else(|| ServiceError::Storage("S3_BUCKET not set".into()))?;

        let mut builder = AmazonS3Builder::new()
            .with_region(&config.region)
            .with_bucket_name(bucket);
        if let Some(ref key) = config.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref endpoint) = config.endpoint_url {
            if !endpoint.is_empty() {
                let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                builder = builder
                    .with_endpoint(&endpoint_url)
                    .with_allow_http(endpoint_url.starts_with("http://"));
            }
        }

        let store = builder.build()?;
        info!(bucket, region = %config.region, "Blob store: S3 backend");
        Ok(Self::new(Arc::new(store)))
    }

    fn object_path(location: &BlobLocation) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", location.bucket, location.object))
    }

    fn marker_path(bucket: &str) -> ObjectPath {
        ObjectPath::from(format!("{bucket}/{BUCKET_MARKER}"))
    }

    async fn exists(&self, path: &ObjectPath) -> Result<Option<u64>, ServiceError> {
        match self.store.head(path).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobs {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ServiceError> {
        Ok(self.exists(&Self::marker_path(bucket)).await?.is_some())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), ServiceError> {
        self.store
            .put(&Self::marker_path(bucket), PutPayload::default())
            .await?;
        debug!(bucket, "bucket created");
        Ok(())
    }

    async fn put(&self, location: &BlobLocation, data: Bytes) -> Result<(), ServiceError> {
        if !self.bucket_exists(&location.bucket).await? {
            return Err(ServiceError::Storage(format!("no such bucket: {}", location.bucket)));
        }
        let size = data.len();
        self.store
            .put(&Self::object_path(location), PutPayload::from(data))
            .await?;
        debug!(%location, size, "object stored");
        Ok(())
    }

    async fn get(&self, location: &BlobLocation) -> Result<Bytes, ServiceError> {
        match self.store.get(&Self::object_path(location)).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => {
                Err(ServiceError::NotFound(format!("object {location}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, location: &BlobLocation) -> Result<Option<u64>, ServiceError> {
        self.exists(&Self::object_path(location)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn location() -> BlobLocation {
        BlobLocation {
            bucket: "artista".into(),
            object: "R1.zip".into(),
        }
    }

    #[tokio::test]
    async fn buckets_are_prefixes_with_a_marker() {
        let blobs = ObjectStoreBlobs::new(Arc::new(InMemory::new()));
        assert!(!blobs.bucket_exists("artista").await.unwrap());
        assert!(blobs.put(&location(), Bytes::from_static(b"zip")).await.is_err());

        blobs.create_bucket("artista").await.unwrap();
        assert!(blobs.bucket_exists("artista").await.unwrap());
        assert!(!blobs.bucket_exists("artistb").await.unwrap());
    }

    #[tokio::test]
    async fn objects_roundtrip_and_stat() {
        let blobs = ObjectStoreBlobs::new(Arc::new(InMemory::new()));
        blobs.create_bucket("artista").await.unwrap();
        assert_eq!(blobs.stat(&location()).await.unwrap(), None);

        blobs
            .put(&location(), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(blobs.stat(&location()).await.unwrap(), Some(7));
        assert_eq!(
            blobs.get(&location()).await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let blobs = ObjectStoreBlobs::new(Arc::new(InMemory::new()));
        let err = blobs.get(&location()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_backend_writes_below_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = ObjectStoreBlobs::local(dir.path()).unwrap();
        blobs.create_bucket("artista").await.unwrap();
        blobs
            .put(&location(), Bytes::from_static(b"zip"))
            .await
            .unwrap();
        assert!(dir.path().join("artista").join("R1.zip").exists());
    }
}
