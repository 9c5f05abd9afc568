//! HTTP endpoint the render engine reports job progress to.
//!
//! `POST /status` takes `renderjobID`, `artistID`, `status` and an optional
//! `imgdirPart`, either form-encoded or as JSON, and republishes them as a
//! status update from the execution proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Form, FromRequest, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use renderflow_bus::{BusError, MessagingClient, Worker};

use crate::contracts::{topics, StatusUpdate};

#[derive(Clone)]
struct CallbackState {
    client: Arc<MessagingClient>,
}

/// Raw callback fields; every one is checked before publishing.
#[derive(Debug, Default, Deserialize)]
struct CallbackForm {
    #[serde(rename = "renderjobID")]
    renderjob_id: Option<String>,
    #[serde(rename = "artistID")]
    artist_id: Option<String>,
    status: Option<RawStatus>,
    #[serde(rename = "imgdirPart")]
    imgdir_part: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStatus {
    Number(i64),
    Text(String),
}

impl CallbackForm {
    fn into_update(self, initiator: &str) -> Result<StatusUpdate, String> {
        let present = |field: Option<String>| field.filter(|v| !v.trim().is_empty());
        let mut missing = Vec::new();
        let renderjob_id = present(self.renderjob_id);
        let artist_id = present(self.artist_id);
        if renderjob_id.is_none() {
            missing.push("renderjobID");
        }
        if artist_id.is_none() {
            missing.push("artistID");
        }
        if self.status.is_none() {
            missing.push("status");
        }
        let (Some(renderjob_id), Some(artist_id), Some(status)) = (renderjob_id, artist_id, self.status)
        else {
            return Err(format!("missing fields: {}", missing.join(", ")));
        };

        let status = match status {
            RawStatus::Number(n) => n,
            RawStatus::Text(text) => {
                renderflow_core::status::parse_raw(&text).map_err(|e| e.to_string())?
            }
        };
        Ok(StatusUpdate {
            renderjob_id,
            artist_id: Some(artist_id),
            status,
            initiator: initiator.to_string(),
            imgdir_part: present(self.imgdir_part),
        })
    }
}

/// Router serving `POST /status` for the given client's service.
pub fn router(client: Arc<MessagingClient>) -> Router {
    Router::new()
        .route("/status", post(status_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(CallbackState { client })
}

async fn status_callback(State(state): State<CallbackState>, request: Request) -> Response {
    let form = match read_form(request).await {
        Ok(form) => form,
        Err(reason) => return bad_request(reason),
    };
    let update = match form.into_update(state.client.service_name()) {
        Ok(update) => update,
        Err(reason) => return bad_request(reason),
    };

    match state.client.publish(&topics::status_update(), &update).await {
        Ok(_) => {
            info!(
                renderjob_id = %update.renderjob_id,
                status = update.status,
                "engine status forwarded"
            );
            (
                StatusCode::ACCEPTED,
                Json(json!({ "renderjobID": update.renderjob_id, "status": update.status.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to forward engine status");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn read_form(request: Request) -> Result<CallbackForm, String> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json {
        Json::<CallbackForm>::from_request(request, &())
            .await
            .map(|Json(form)| form)
            .map_err(|e| e.body_text())
    } else {
        Form::<CallbackForm>::from_request(request, &())
            .await
            .map(|Form(form)| form)
            .map_err(|e| e.body_text())
    }
}

fn bad_request(reason: String) -> Response {
    warn!(%reason, "rejected status callback");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
}

// ── Worker ───────────────────────────────────────────────────────────

/// Serves the callback router for the lifetime of the node.
pub struct CallbackServer {
    client: Arc<MessagingClient>,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackServer {
    pub fn new(client: Arc<MessagingClient>, addr: SocketAddr) -> Self {
        Self {
            client,
            addr,
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Worker for CallbackServer {
    async fn start(&self) -> Result<(), BusError> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| BusError::Transport(format!("failed to bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "status callback listening");

        let app = router(Arc::clone(&self.client));
        let shutdown = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await
            {
                error!(error = %e, "status callback server failed");
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("status callback stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "status-callback"
    }
}
