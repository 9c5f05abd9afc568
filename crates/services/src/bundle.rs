//! Directory bundles: every file below a root, MessagePack-encoded and
//! zstd-compressed into one blob.

use std::fs;
use std::path::{Component, Path};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use renderflow_core::paths::relative_slash_path;

use crate::collaborators::Archiver;
use crate::error::ServiceError;

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct Bundle {
    entries: Vec<BundleEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleEntry {
    /// Forward-slash path relative to the bundle root.
    path: String,
    #[serde(with = "raw_bytes")]
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BundleArchiver;

impl BundleArchiver {
    pub fn new() -> Self {
        Self
    }

    fn pack_blocking(dir: &Path) -> Result<Vec<u8>, ServiceError> {
        if !dir.is_dir() {
            return Err(ServiceError::NotFound(format!("directory {}", dir.display())));
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ServiceError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = relative_slash_path(dir, entry.path()) else {
                continue;
            };
            entries.push(BundleEntry {
                path,
                data: fs::read(entry.path())?,
            });
        }

        let encoded = rmp_serde::to_vec(&Bundle { entries })
            .map_err(|e| ServiceError::Storage(format!("bundle encode: {e}")))?;
        Ok(zstd::encode_all(encoded.as_slice(), COMPRESSION_LEVEL)?)
    }

    fn unpack_blocking(data: &[u8], dest: &Path) -> Result<Vec<String>, ServiceError> {
        let raw = zstd::decode_all(data)?;
        let bundle: Bundle = rmp_serde::from_slice(&raw)
            .map_err(|e| ServiceError::Storage(format!("bundle decode: {e}")))?;

        fs::create_dir_all(dest)?;
        let mut written = Vec::with_capacity(bundle.entries.len());
        for entry in bundle.entries {
            if !is_contained(&entry.path) {
                return Err(ServiceError::Storage(format!(
                    "bundle entry escapes its root: {}",
                    entry.path
                )));
            }
            let target = dest.join(&entry.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &entry.data)?;
            written.push(entry.path);
        }
        Ok(written)
    }
}

/// Relative, with no `..` or root components.
fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl Archiver for BundleArchiver {
    async fn pack(&self, dir: &Path) -> Result<Bytes, ServiceError> {
        let dir = dir.to_path_buf();
        let packed = tokio::task::spawn_blocking(move || Self::pack_blocking(&dir))
            .await
            .map_err(|e| ServiceError::Storage(format!("pack task failed: {e}")))??;
        debug!(size = packed.len(), "directory packed");
        Ok(Bytes::from(packed))
    }

    async fn unpack(&self, data: Bytes, dest: &Path) -> Result<Vec<String>, ServiceError> {
        let dest = dest.to_path_buf();
        let files = tokio::task::spawn_blocking(move || Self::unpack_blocking(&data, &dest))
            .await
            .map_err(|e| ServiceError::Storage(format!("unpack task failed: {e}")))??;
        debug!(files = files.len(), "bundle unpacked");
        Ok(files)
    }
}

mod raw_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(root: &Path) {
        fs::create_dir_all(root.join("images")).unwrap();
        fs::create_dir_all(root.join("scenes")).unwrap();
        fs::write(root.join("workspace.mel"), "//Maya").unwrap();
        fs::write(root.join("scenes/shot.ma"), "requires maya").unwrap();
        fs::write(root.join("images/beauty.0001.exr"), [0u8, 159, 255]).unwrap();
    }

    #[tokio::test]
    async fn unpack_restores_files_and_lists_them() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        project(src.path());

        let archiver = BundleArchiver::new();
        let packed = archiver.pack(src.path()).await.unwrap();
        let mut files = archiver.unpack(packed, dst.path()).await.unwrap();
        files.sort();

        assert_eq!(
            files,
            vec!["images/beauty.0001.exr", "scenes/shot.ma", "workspace.mel"]
        );
        assert_eq!(
            fs::read(dst.path().join("images/beauty.0001.exr")).unwrap(),
            vec![0u8, 159, 255]
        );
    }

    #[tokio::test]
    async fn packing_a_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundleArchiver::new()
            .pack(&dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = BundleArchiver::new()
            .unpack(Bytes::from_static(b"not a bundle"), dir.path())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn escaping_paths_are_not_contained() {
        assert!(is_contained("images/a.exr"));
        assert!(!is_contained("../etc/passwd"));
        assert!(!is_contained("/abs"));
        assert!(!is_contained(""));
    }
}
