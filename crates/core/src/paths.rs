use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Token in the job description document replaced by the engine-visible job path.
pub const WORKSPACE_PLACEHOLDER: &str = "[WORKSPACE_PATH]";

/// Bucket + object name of an artifact in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
    pub bucket: String,
    pub object: String,
}

impl std::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

/// Where job assets live on disk, in the blob store, and as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    /// Local staging root, e.g. `/mnt/RRPROJECTS`.
    pub local_root: PathBuf,
    /// Environment segment below both roots (`PROD` or `DEV`).
    pub environment: String,
    /// The same share as mounted on the render nodes.
    pub engine_root: String,
}

impl StorageLayout {
    pub fn new(local_root: impl Into<PathBuf>, environment: impl Into<String>, engine_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            environment: environment.into(),
            engine_root: engine_root.into(),
        }
    }

    /// Base directory all jobs are staged below.
    pub fn base_dir(&self) -> PathBuf {
        self.local_root.join(&self.environment)
    }

    pub fn artist_dir(&self, artist_id: &str) -> PathBuf {
        self.base_dir().join(artist_id)
    }

    pub fn job_dir(&self, artist_id: &str, renderjob_id: &str) -> PathBuf {
        self.artist_dir(artist_id).join(renderjob_id)
    }

    /// Job directory as the render nodes address it.
    pub fn engine_job_path(&self, artist_id: &str, renderjob_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            trim_trailing_slashes(&self.engine_root),
            self.environment,
            artist_id,
            renderjob_id
        )
    }

    /// Uploaded asset of a job.
    pub fn asset_location(&self, artist_id: &str, renderjob_id: &str) -> BlobLocation {
        BlobLocation {
            bucket: artist_bucket(artist_id),
            object: format!("{renderjob_id}.zip"),
        }
    }

    /// Packaged render output offered for download.
    ///
    /// Shares the object name of the uploaded asset and replaces it.
    pub fn download_location(&self, artist_id: &str, renderjob_id: &str) -> BlobLocation {
        self.asset_location(artist_id, renderjob_id)
    }

    /// Directory holding the rendered images of a job.
    pub fn images_dir(&self, artist_id: &str, renderjob_id: &str, imgdir_part: &str) -> PathBuf {
        self.job_dir(artist_id, renderjob_id)
            .join(strip_slashes(imgdir_part))
    }
}

/// Buckets are named after the artist, lower-cased.
pub fn artist_bucket(artist_id: &str) -> String {
    artist_id.to_lowercase()
}

/// Remove every `/` and `\` from the input.
pub fn strip_slashes(input: &str) -> String {
    input.chars().filter(|c| *c != '/' && *c != '\\').collect()
}

pub fn trim_trailing_slashes(input: &str) -> &str {
    input.trim_end_matches(['/', '\\'])
}

/// Express `path` relative to `root` with forward slashes.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StorageLayout {
        StorageLayout::new("/mnt/RRPROJECTS", "DEV", "//render-host/student/_IFS/")
    }

    #[test]
    fn local_job_dir() {
        assert_eq!(
            layout().job_dir("A1", "R1"),
            PathBuf::from("/mnt/RRPROJECTS/DEV/A1/R1")
        );
    }

    #[test]
    fn engine_path_drops_trailing_slash() {
        assert_eq!(
            layout().engine_job_path("A1", "R1"),
            "//render-host/student/_IFS/DEV/A1/R1"
        );
    }

    #[test]
    fn asset_lives_in_lowercased_artist_bucket() {
        let loc = layout().asset_location("ArtistA", "R1");
        assert_eq!(loc.bucket, "artista");
        assert_eq!(loc.object, "R1.zip");
        assert_eq!(loc.to_string(), "artista/R1.zip");
    }

    #[test]
    fn strip_slashes_removes_both_kinds() {
        assert_eq!(strip_slashes("/images\\beauty/"), "imagesbeauty");
        assert_eq!(strip_slashes("images"), "images");
    }

    #[test]
    fn images_dir_sanitizes_part() {
        assert_eq!(
            layout().images_dir("A1", "R1", "/images/"),
            PathBuf::from("/mnt/RRPROJECTS/DEV/A1/R1/images")
        );
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let root = Path::new("/tmp/job");
        assert_eq!(
            relative_slash_path(root, Path::new("/tmp/job/images/a.exr")),
            Some("images/a.exr".to_string())
        );
        assert_eq!(relative_slash_path(root, root), None);
    }
}
