//! Typed payloads of every pipeline event.
//!
//! Inbound messages are decoded once, at the consumer boundary, into the
//! closed [`EventPayload`] set selected by the routing key they arrived on.
//! Field names follow the wire contract (`artistID`, `renderjobID`, camelCase
//! otherwise).

use serde::{Deserialize, Serialize};

use renderflow_bus::{Envelope, EventKey};
use renderflow_core::{translate, CanonicalStatus};

use super::topics;
use crate::collaborators::CommandOutput;
use crate::error::ServiceError;

// ── Storage allocation ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    #[serde(rename = "artistID")]
    pub artist_id: String,
    #[serde(rename = "renderjobID")]
    pub renderjob_id: String,
}

/// Where the uploader must put a new job's asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDescriptor {
    pub bucket: String,
    pub object_name: String,
    #[serde(rename = "renderjobID")]
    pub renderjob_id: String,
    #[serde(rename = "artistID")]
    pub artist_id: String,
}

/// Answer to a storage allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageReply {
    Allocated(StorageDescriptor),
    Refused { error: String },
}

// ── Staging ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequested {
    #[serde(rename = "artistID")]
    pub artist_id: String,
    #[serde(rename = "renderjobID")]
    pub renderjob_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionFinished {
    /// Job directory as the render nodes see it.
    pub renderjob_base_path: String,
    pub relative_file_paths: Vec<String>,
    #[serde(rename = "artistID")]
    pub artist_id: String,
    #[serde(rename = "renderjobID")]
    pub renderjob_id: String,
    /// Submitter binary on the render side.
    pub rr_path: String,
}

// ── Engine submission ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitSend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_options: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReply {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Legacy proxies send `err` as a string or as a serialized error object.
    #[serde(
        default,
        alias = "err",
        deserialize_with = "legacy_error::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

impl SubmitReply {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// The submission failed when either an error or any stderr output is present.
    pub fn failure(&self) -> Option<String> {
        match (&self.error, self.stderr.trim()) {
            (Some(error), _) if !error.is_empty() => Some(error.clone()),
            (_, stderr) if !stderr.is_empty() => Some(stderr.to_string()),
            _ => None,
        }
    }
}

impl From<CommandOutput> for SubmitReply {
    fn from(out: CommandOutput) -> Self {
        Self {
            stdout: out.stdout,
            stderr: out.stderr,
            error: out.error,
        }
    }
}

// ── Status propagation ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(rename = "renderjobID")]
    pub renderjob_id: String,
    #[serde(rename = "artistID", default, skip_serializing_if = "Option::is_none")]
    pub artist_id: Option<String>,
    /// Raw status in either the ledger or the engine space.
    #[serde(with = "raw_status")]
    pub status: i64,
    /// Service that produced the event.
    pub initiator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imgdir_part: Option<String>,
}

impl StatusUpdate {
    pub fn new(
        renderjob_id: impl Into<String>,
        artist_id: impl Into<String>,
        status: CanonicalStatus,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            renderjob_id: renderjob_id.into(),
            artist_id: Some(artist_id.into()),
            status: status.code().into(),
            initiator: initiator.into(),
            imgdir_part: None,
        }
    }

    /// Canonical reading of the raw status, `None` when it has no opinion.
    pub fn canonical(&self) -> Option<CanonicalStatus> {
        translate(self.status)
    }

    pub fn is_from(&self, service: &str) -> bool {
        self.initiator == service
    }
}

/// `status` travels as a stringified integer; plain numbers are accepted too.
mod raw_status {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(status: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&status.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(text) => {
                renderflow_core::status::parse_raw(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}

mod legacy_error {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null | Value::Bool(false) => None,
            Value::String(text) => Some(text),
            Value::Object(fields) => match fields.get("message") {
                Some(Value::String(message)) if !message.is_empty() => Some(message.clone()),
                _ => Some(Value::Object(fields).to_string()),
            },
            other => Some(other.to_string()),
        })
    }
}

// ── Closed event set ─────────────────────────────────────────────────

/// Every payload a pipeline consumer may receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    StorageRequest(StorageRequest),
    SubmitRequested(SubmitRequested),
    TransitionFinished(TransitionFinished),
    SubmitSend(SubmitSend),
    StatusUpdate(StatusUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    StorageRequest,
    SubmitRequested,
    TransitionFinished,
    SubmitSend,
    StatusUpdate,
}

impl PayloadKind {
    fn event(self) -> EventKey {
        match self {
            Self::StorageRequest => topics::upload_requested(),
            Self::SubmitRequested => topics::submit_requested(),
            Self::TransitionFinished => topics::transition_finished(),
            Self::SubmitSend => topics::submit_send(),
            Self::StatusUpdate => topics::status_update(),
        }
    }

    fn of(routing_key: &str) -> Option<Self> {
        [
            Self::StorageRequest,
            Self::SubmitRequested,
            Self::TransitionFinished,
            Self::SubmitSend,
            Self::StatusUpdate,
        ]
        .into_iter()
        .find(|kind| {
            let event = kind.event();
            routing_key == event.routing_key() || routing_key == event.rpc_routing_key()
        })
    }
}

impl EventPayload {
    /// Decode an inbound envelope according to the event it was routed as.
    pub fn decode(envelope: &Envelope) -> Result<Self, ServiceError> {
        let kind = PayloadKind::of(&envelope.routing_key).ok_or_else(|| {
            ServiceError::Protocol(format!("unknown event {}", envelope.routing_key))
        })?;
        let payload = match kind {
            PayloadKind::StorageRequest => Self::StorageRequest(body(envelope)?),
            PayloadKind::SubmitRequested => Self::SubmitRequested(body(envelope)?),
            PayloadKind::TransitionFinished => Self::TransitionFinished(body(envelope)?),
            PayloadKind::SubmitSend => Self::SubmitSend(body(envelope)?),
            PayloadKind::StatusUpdate => Self::StatusUpdate(body(envelope)?),
        };
        Ok(payload)
    }

    /// The event this payload is published as.
    pub fn event(&self) -> EventKey {
        self.kind().event()
    }

    fn kind(&self) -> PayloadKind {
        match self {
            Self::StorageRequest(_) => PayloadKind::StorageRequest,
            Self::SubmitRequested(_) => PayloadKind::SubmitRequested,
            Self::TransitionFinished(_) => PayloadKind::TransitionFinished,
            Self::SubmitSend(_) => PayloadKind::SubmitSend,
            Self::StatusUpdate(_) => PayloadKind::StatusUpdate,
        }
    }
}

fn body<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, ServiceError> {
    envelope
        .decode()
        .map_err(|e| ServiceError::Protocol(e.to_string()))
}

/// Extract one variant, rejecting any other event as a protocol error.
macro_rules! payload_variant {
    ($variant:ident) => {
        impl TryFrom<EventPayload> for $variant {
            type Error = ServiceError;

            fn try_from(payload: EventPayload) -> Result<Self, Self::Error> {
                match payload {
                    EventPayload::$variant(inner) => Ok(inner),
                    other => Err(ServiceError::Protocol(format!(
                        "expected {} but got {}",
                        stringify!($variant),
                        other.event()
                    ))),
                }
            }
        }
    };
}

payload_variant!(StorageRequest);
payload_variant!(SubmitRequested);
payload_variant!(TransitionFinished);
payload_variant!(SubmitSend);
payload_variant!(StatusUpdate);

/// Decode `envelope` and insist on one payload type.
pub fn decode_as<T>(envelope: &Envelope) -> Result<T, ServiceError>
where
    T: TryFrom<EventPayload, Error = ServiceError>,
{
    EventPayload::decode(envelope)?.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event: &EventKey, body: serde_json::Value) -> Envelope {
        Envelope::json(event.routing_key(), &body).unwrap()
    }

    #[test]
    fn status_accepts_string_and_number() {
        let text: StatusUpdate = serde_json::from_value(json!({
            "renderjobID": "R1", "artistID": "A1", "status": "307", "initiator": "Files"
        }))
        .unwrap();
        let number: StatusUpdate = serde_json::from_value(json!({
            "renderjobID": "R1", "artistID": "A1", "status": 307, "initiator": "Files"
        }))
        .unwrap();
        assert_eq!(text, number);
        assert_eq!(text.canonical(), Some(CanonicalStatus::Finished));
        assert!(text.is_from("Files"));
    }

    #[test]
    fn status_serializes_as_string() {
        let update = StatusUpdate::new("R1", "A1", CanonicalStatus::Error, "Jobs");
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["status"], "311");
        assert_eq!(value["artistID"], "A1");
        assert!(value.get("imgdirPart").is_none());
    }

    #[test]
    fn non_numeric_status_is_rejected() {
        let result: Result<StatusUpdate, _> = serde_json::from_value(json!({
            "renderjobID": "R1", "status": "done", "initiator": "Files"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn decode_follows_the_routing_key() {
        let env = envelope(
            &topics::submit_requested(),
            json!({"artistID": "A1", "renderjobID": "R1"}),
        );
        let payload = EventPayload::decode(&env).unwrap();
        assert_eq!(payload.event(), topics::submit_requested());

        let request: SubmitRequested = decode_as(&env).unwrap();
        assert_eq!(request.renderjob_id, "R1");
        assert!(matches!(
            decode_as::<StatusUpdate>(&env),
            Err(ServiceError::Protocol(_))
        ));
    }

    #[test]
    fn rpc_keys_decode_as_their_event() {
        let env = Envelope::json(
            topics::upload_requested().rpc_routing_key(),
            &json!({"artistID": "A1", "renderjobID": "R1"}),
        )
        .unwrap();
        assert!(matches!(
            EventPayload::decode(&env).unwrap(),
            EventPayload::StorageRequest(_)
        ));
    }

    #[test]
    fn unknown_routing_key_is_a_protocol_error() {
        let env = Envelope::json("renderjob.unknown.event", &json!({})).unwrap();
        assert!(matches!(
            EventPayload::decode(&env),
            Err(ServiceError::Protocol(_))
        ));
    }

    #[test]
    fn missing_fields_are_a_protocol_error() {
        let env = envelope(&topics::transition_finished(), json!({"renderjobID": "R1"}));
        assert!(matches!(
            EventPayload::decode(&env),
            Err(ServiceError::Protocol(_))
        ));
    }

    #[test]
    fn submit_reply_reads_legacy_err_field() {
        let reply: SubmitReply =
            serde_json::from_value(json!({"err": "spawn failed", "stdout": ""})).unwrap();
        assert_eq!(reply.failure().as_deref(), Some("spawn failed"));

        let stderr_only: SubmitReply =
            serde_json::from_value(json!({"stdout": "ok", "stderr": "warning: x\n"})).unwrap();
        assert_eq!(stderr_only.failure().as_deref(), Some("warning: x"));

        let clean: SubmitReply = serde_json::from_value(json!({"stdout": "Job submitted"})).unwrap();
        assert_eq!(clean.failure(), None);

        let null_err: SubmitReply =
            serde_json::from_value(json!({"err": null, "stdout": "Job submitted"})).unwrap();
        assert_eq!(null_err.failure(), None);
    }

    #[test]
    fn submit_reply_reads_error_objects() {
        let with_message: SubmitReply = serde_json::from_value(json!({
            "err": {"code": 1, "message": "license server unreachable"},
            "stdout": ""
        }))
        .unwrap();
        assert_eq!(with_message.failure().as_deref(), Some("license server unreachable"));

        let bare: SubmitReply =
            serde_json::from_value(json!({"err": {"code": "ENOENT", "killed": false}})).unwrap();
        let failure = bare.failure().unwrap();
        assert!(failure.contains("ENOENT"), "{failure}");
    }

    #[test]
    fn storage_reply_variants() {
        let allocated: StorageReply = serde_json::from_value(json!({
            "bucket": "a1", "objectName": "R1.zip", "renderjobID": "R1", "artistID": "A1"
        }))
        .unwrap();
        assert!(matches!(allocated, StorageReply::Allocated(ref d) if d.object_name == "R1.zip"));

        let refused: StorageReply =
            serde_json::from_value(json!({"error": "Renderjob already exists"})).unwrap();
        assert_eq!(
            refused,
            StorageReply::Refused {
                error: "Renderjob already exists".into()
            }
        );
    }
}
