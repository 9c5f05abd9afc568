//! Event shapes exchanged between the render pipeline services.

pub mod payloads;
pub mod topics;

pub use payloads::{
    EventPayload, StatusUpdate, StorageDescriptor, StorageReply, StorageRequest, SubmitReply,
    SubmitRequested, SubmitSend, TransitionFinished,
};

/// Service owning the job ledger and the engine submission.
pub const JOBS_SERVICE: &str = "Jobs";

/// Service owning blob storage, staging and packaging.
pub const FILES_SERVICE: &str = "Files";

/// Service in front of the render engine.
pub const PROXY_SERVICE: &str = "submitProxy";

pub const PROXY_REPLY_QUEUE: &str = "renderjob.submitproxy.reply-to";
