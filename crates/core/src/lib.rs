pub mod command;
pub mod config;
pub mod error;
pub mod job;
pub mod manifest;
pub mod paths;
pub mod status;

pub use config::Config;
pub use error::CoreError;
pub use job::{EngineLayer, EngineSnapshot, Job, JobRecord};
pub use manifest::{JobKind, ManifestRule, MayaRule};
pub use paths::{BlobLocation, StorageLayout};
pub use status::{advance, reconcile, translate, CanonicalStatus, EngineState};
