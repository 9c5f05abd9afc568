use renderflow_bus::EventKey;

const RENDERJOB: &str = "renderjob";

/// RPC: allocate storage for a new job's asset.
pub fn upload_requested() -> EventKey {
    EventKey::new(RENDERJOB, "upload", "requested")
}

/// The uploaded asset should be staged for rendering.
pub fn submit_requested() -> EventKey {
    EventKey::new(RENDERJOB, "submit", "requested")
}

/// The asset is staged and its description points at the render share.
pub fn transition_finished() -> EventKey {
    EventKey::new(RENDERJOB, "transition", "finished")
}

/// RPC: run the engine submitter.
pub fn submit_send() -> EventKey {
    EventKey::new(RENDERJOB, "submit", "send")
}

pub fn status_update() -> EventKey {
    EventKey::new(RENDERJOB, "status", "update")
}
