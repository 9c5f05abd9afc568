use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Wire envelope carried through the broker.
///
/// The body is always JSON. Between a remote client and the broker daemon
/// the whole envelope is MessagePack-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing key the envelope was published with.
    pub routing_key: String,

    /// JSON-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,

    pub content_type: String,

    /// Present on requests and on their replies.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,

    /// Queue the reply must be sent to.
    #[serde(default)]
    pub reply_to: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope, serializing the payload as JSON.
    pub fn json<T: Serialize + ?Sized>(routing_key: impl Into<String>, payload: &T) -> Result<Self, BusError> {
        Ok(Self {
            routing_key: routing_key.into(),
            body: serde_json::to_vec(payload)?,
            content_type: CONTENT_TYPE_JSON.to_string(),
            correlation_id: None,
            reply_to: None,
            timestamp: Utc::now(),
        })
    }

    /// Mark this envelope as a request expecting a reply on `reply_to`.
    pub fn with_reply(mut self, correlation_id: Uuid, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id);
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Deserialize the JSON body into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        if self.content_type != CONTENT_TYPE_JSON {
            return Err(BusError::Protocol(format!(
                "unsupported content type '{}'",
                self.content_type
            )));
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| BusError::Protocol(format!("malformed body on {}: {e}", self.routing_key)))
    }

    /// Body as an untyped JSON value.
    pub fn json_value(&self) -> Result<serde_json::Value, BusError> {
        self.decode()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
