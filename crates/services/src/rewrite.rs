use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use renderflow_core::paths::WORKSPACE_PLACEHOLDER;

use crate::collaborators::DescriptionRewriter;
use crate::error::ServiceError;

/// Replaces the workspace placeholder in the first top-level `*.xml` of a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRewriter;

impl PlaceholderRewriter {
    pub fn new() -> Self {
        Self
    }

    async fn first_description(job_dir: &Path) -> Result<PathBuf, ServiceError> {
        let mut entries = tokio::fs::read_dir(job_dir).await?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_xml = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
            if is_xml && entry.file_type().await?.is_file() {
                candidates.push(path);
            }
        }
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| {
            ServiceError::DomainValidation(format!(
                "no job description in {}",
                job_dir.display()
            ))
        })
    }
}

#[async_trait]
impl DescriptionRewriter for PlaceholderRewriter {
    async fn rewrite(&self, job_dir: &Path, workspace_path: &str) -> Result<PathBuf, ServiceError> {
        let document = Self::first_description(job_dir).await?;
        let content = tokio::fs::read_to_string(&document).await?;
        let replacements = content.matches(WORKSPACE_PLACEHOLDER).count();
        tokio::fs::write(&document, content.replace(WORKSPACE_PLACEHOLDER, workspace_path)).await?;
        debug!(document = %document.display(), replacements, "job description rewritten");
        Ok(document)
    }
}
