pub mod blob;
pub mod bundle;
pub mod callback;
pub mod collaborators;
pub mod config;
pub mod contracts;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod memory;
pub mod rewrite;
pub mod workers;

pub use blob::ObjectStoreBlobs;
pub use bundle::BundleArchiver;
pub use callback::CallbackServer;
pub use collaborators::{
    Archiver, BlobStore, CommandExecutor, CommandOutput, DescriptionRewriter, Engine,
    IdentityVerifier, Ledger,
};
pub use config::{NodeConfig, Role};
pub use error::ServiceError;
pub use executor::ProcessExecutor;
pub use jobs::{JobService, JobsNode};
pub use memory::{MemoryBlobStore, MemoryEngine, MemoryLedger, StaticIdentity};
pub use rewrite::PlaceholderRewriter;
pub use workers::{
    EngineSubmitWorker, PackageWorker, ProxyWorker, StatusWorker, StorageWorker, TransitionWorker,
};
