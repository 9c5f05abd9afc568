use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::paths::StorageLayout;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub blob: BlobConfig,
    pub callback: CallbackConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `RENDERFLOW_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("RENDERFLOW_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            engine: EngineConfig::from_env_profiled(p),
            blob: BlobConfig::from_env_profiled(p),
            callback: CallbackConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(
            self.storage.local_root.clone(),
            self.storage.environment.clone(),
            self.storage.engine_root.clone(),
        )
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  storage:   local_root={}, environment={}",
            self.storage.local_root.display(),
            self.storage.environment
        );
        tracing::info!("  engine:    submitter={}", self.engine.submitter_path);
        tracing::info!(
            "  blob:      backend={}, configured={}",
            self.blob.backend,
            self.blob.is_configured()
        );
        tracing::info!("  callback:  port={}", self.callback.port);
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub local_root: PathBuf,
    /// `PROD` or `DEV`; selects the subtree below both roots.
    pub environment: String,
    pub engine_root: String,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            local_root: PathBuf::from(profiled_env_or(p, "RRPROJECTS_ROOT", "/mnt/RRPROJECTS")),
            environment: profiled_env_or(p, "RRPROJECTS_ENV", "DEV").to_uppercase(),
            engine_root: profiled_env_or(p, "ENGINE_PROJECTS_ROOT", "//render-server/student/_IFS"),
        }
    }
}

// ── Render engine ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Submitter path advertised by the files service in `rrPath`.
    pub submitter_path: String,
    /// Submitter binary the execution proxy runs.
    pub proxy_submitter: String,
    /// Project base the proxy prefixes to the description path.
    pub proxy_project_base: String,
}

impl EngineConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            submitter_path: profiled_env_or(p, "RR_SUBMITTER", "/mnt/RR/bin/lx64/rrSubmitterconsole"),
            proxy_submitter: profiled_env_or(p, "PROXY_SUBMITTER", "/mnt/RR/bin/lx64/rrSubmitterconsole"),
            proxy_project_base: profiled_env_or(p, "PROXY_PROJECT_BASE", "/mnt/RRPROJECTS/DEV"),
        }
    }
}

// ── Blob store ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// "local" or "s3"
    pub backend: String,
    pub local_dir: PathBuf,
    pub region: String,
    pub s3_bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

impl BlobConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            backend: profiled_env_or(p, "BLOB_BACKEND", "local"),
            local_dir: PathBuf::from(profiled_env_or(p, "BLOB_DIR", "data/blobs")),
            region: profiled_env_or(p, "AWS_REGION", "eu-central-1"),
            s3_bucket: profiled_env_opt(p, "S3_BUCKET"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.backend.as_str() {
            "s3" => self.s3_bucket.is_some(),
            _ => true,
        }
    }
}

// ── Engine callback endpoint ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub host: String,
    pub port: u16,
}

impl CallbackConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "CALLBACK_HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "CALLBACK_PORT", 3005),
        }
    }
}
