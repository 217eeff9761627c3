//! Wire protocol between the remote-socket backend and the daemon.
//!
//! Every WebSocket text message is one JSON `Frame`:
//!
//! ```text
//! {"type":"request","id":7,"request":{"event":"space:load-doc","data":{...}}}
//! {"type":"ack","id":7,"response":{"data":{...}}}
//! {"type":"ack","id":7,"response":{"error":{"name":"SPACE_NOT_JOINED","message":"..."}}}
//! {"type":"event","event":{"event":"space:broadcast-doc-update","data":{...}}}
//! ```
//!
//! Binary payloads travel as base64 strings, timestamps as integer
//! microseconds since the epoch.

use crate::error::{Result, StoreError};
use crate::storage::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum frame size accepted on either side (50MB).
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// Version string sent with `space:join`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    Workspace,
    Userspace,
}

impl std::fmt::Display for SpaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpaceType::Workspace => f.write_str("workspace"),
            SpaceType::Userspace => f.write_str("userspace"),
        }
    }
}

/// Client-to-server calls. Each gets exactly one ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum Request {
    #[serde(rename = "space:join")]
    JoinSpace {
        space_type: SpaceType,
        space_id: String,
        client_version: String,
    },
    #[serde(rename = "space:leave")]
    LeaveSpace {
        space_type: SpaceType,
        space_id: String,
    },
    /// Replies with a `WireDocDiff` or `null`.
    #[serde(rename = "space:load-doc")]
    LoadDoc {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
        #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
        state_vector: Option<Vec<u8>>,
    },
    /// Replies with `{"timestamp": micros}`.
    #[serde(rename = "space:push-doc-update")]
    PushDocUpdate {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
        #[serde(with = "b64")]
        update: Vec<u8>,
    },
    /// Replies with `{docId: micros}`.
    #[serde(rename = "space:load-doc-timestamps")]
    LoadDocTimestamps {
        space_type: SpaceType,
        space_id: String,
        #[serde(
            default,
            with = "chrono::serde::ts_microseconds_option",
            skip_serializing_if = "Option::is_none"
        )]
        timestamp: Option<Timestamp>,
    },
    /// Replies with `[WireDocUpdate]` for every doc changed after `since`.
    #[serde(rename = "space:load-doc-updates-since")]
    LoadDocUpdatesSince {
        space_type: SpaceType,
        space_id: String,
        #[serde(with = "chrono::serde::ts_microseconds")]
        since: Timestamp,
    },
    #[serde(rename = "space:delete-doc")]
    DeleteDoc {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
    },
    #[serde(rename = "space:update-awareness")]
    UpdateAwareness {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
        #[serde(with = "b64")]
        awareness_update: Vec<u8>,
    },
    /// Replies with the latest awareness payload of every other client on the doc.
    #[serde(rename = "space:load-awarenesses")]
    LoadAwarenesses {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
    },
    /// Replies with a `WireBlob` or `null`.
    #[serde(rename = "blob:get")]
    GetBlob {
        space_type: SpaceType,
        space_id: String,
        key: String,
    },
    #[serde(rename = "blob:set")]
    SetBlob {
        space_type: SpaceType,
        space_id: String,
        blob: WireBlob,
    },
    #[serde(rename = "blob:delete")]
    DeleteBlob {
        space_type: SpaceType,
        space_id: String,
        key: String,
        permanently: bool,
    },
    #[serde(rename = "blob:release")]
    ReleaseBlobs {
        space_type: SpaceType,
        space_id: String,
    },
    /// Replies with `[ListedBlobRecord]`.
    #[serde(rename = "blob:list")]
    ListBlobs {
        space_type: SpaceType,
        space_id: String,
    },
    /// Replies with a boolean.
    #[serde(rename = "blob:exists")]
    BlobExists {
        space_type: SpaceType,
        space_id: String,
        key: String,
    },
}

impl Request {
    /// `(spaceType, spaceId)` the request targets.
    pub fn space(&self) -> (SpaceType, &str) {
        match self {
            Request::JoinSpace { space_type, space_id, .. }
            | Request::LeaveSpace { space_type, space_id }
            | Request::LoadDoc { space_type, space_id, .. }
            | Request::PushDocUpdate { space_type, space_id, .. }
            | Request::LoadDocTimestamps { space_type, space_id, .. }
            | Request::LoadDocUpdatesSince { space_type, space_id, .. }
            | Request::DeleteDoc { space_type, space_id, .. }
            | Request::UpdateAwareness { space_type, space_id, .. }
            | Request::LoadAwarenesses { space_type, space_id, .. }
            | Request::GetBlob { space_type, space_id, .. }
            | Request::SetBlob { space_type, space_id, .. }
            | Request::DeleteBlob { space_type, space_id, .. }
            | Request::ReleaseBlobs { space_type, space_id }
            | Request::ListBlobs { space_type, space_id }
            | Request::BlobExists { space_type, space_id, .. } => (*space_type, space_id.as_str()),
        }
    }

    /// Wire name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::JoinSpace { .. } => "space:join",
            Request::LeaveSpace { .. } => "space:leave",
            Request::LoadDoc { .. } => "space:load-doc",
            Request::PushDocUpdate { .. } => "space:push-doc-update",
            Request::LoadDocTimestamps { .. } => "space:load-doc-timestamps",
            Request::LoadDocUpdatesSince { .. } => "space:load-doc-updates-since",
            Request::DeleteDoc { .. } => "space:delete-doc",
            Request::UpdateAwareness { .. } => "space:update-awareness",
            Request::LoadAwarenesses { .. } => "space:load-awarenesses",
            Request::GetBlob { .. } => "blob:get",
            Request::SetBlob { .. } => "blob:set",
            Request::DeleteBlob { .. } => "blob:delete",
            Request::ReleaseBlobs { .. } => "blob:release",
            Request::ListBlobs { .. } => "blob:list",
            Request::BlobExists { .. } => "blob:exists",
        }
    }
}

/// Server-to-client pushes, scoped by `(spaceType, spaceId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "space:broadcast-doc-update")]
    BroadcastDocUpdate {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
        #[serde(with = "b64")]
        update: Vec<u8>,
        #[serde(with = "chrono::serde::ts_microseconds")]
        timestamp: Timestamp,
    },
    #[serde(rename = "space:broadcast-awareness-update")]
    BroadcastAwarenessUpdate {
        space_type: SpaceType,
        space_id: String,
        doc_id: String,
        #[serde(with = "b64")]
        awareness_update: Vec<u8>,
    },
}

impl ServerEvent {
    pub fn space(&self) -> (SpaceType, &str) {
        match self {
            ServerEvent::BroadcastDocUpdate { space_type, space_id, .. }
            | ServerEvent::BroadcastAwarenessUpdate { space_type, space_id, .. } => {
                (*space_type, space_id.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
}

/// Reply body: exactly one of `data` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckPayload {
    Data(serde_json::Value),
    Error(WireError),
}

impl AckPayload {
    pub fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => AckPayload::Data(value),
            Err(e) => AckPayload::Error(WireError {
                name: "INTERNAL".into(),
                message: e.to_string(),
            }),
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        AckPayload::Error(WireError {
            name: name.into(),
            message: message.into(),
        })
    }

    /// Error reply for a failed storage call.
    pub fn from_error(err: &StoreError) -> Self {
        let name = match err {
            StoreError::Protocol { name, .. } => name.as_str(),
            StoreError::Connection(_) => "CONNECTION",
            StoreError::Integrity(_) => "INTEGRITY",
            StoreError::Readonly(_) => "READONLY",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Cancelled => "CANCELLED",
            StoreError::Io(_)
            | StoreError::Database(_)
            | StoreError::Serialization(_)
            | StoreError::Config(_) => "INTERNAL",
        };
        let message = match err {
            StoreError::Protocol { message, .. } => message.clone(),
            other => other.to_string(),
        };
        AckPayload::error(name, message)
    }

    /// Decode `data`; an `error` reply becomes `StoreError::Protocol`.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            AckPayload::Data(value) => Ok(serde_json::from_value(value)?),
            AckPayload::Error(WireError { name, message }) => Err(StoreError::Protocol { name, message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Request { id: u64, request: Request },
    Ack { id: u64, response: AckPayload },
    Event { event: ServerEvent },
}

impl Frame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(StoreError::protocol(
                "FRAME_TOO_LARGE",
                format!("{} bytes", text.len()),
            ));
        }
        serde_json::from_str(text).map_err(|e| StoreError::protocol("BAD_FRAME", e.to_string()))
    }
}

/// `space:load-doc` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDocDiff {
    #[serde(with = "b64")]
    pub missing: Vec<u8>,
    #[serde(with = "b64")]
    pub state: Vec<u8>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: Timestamp,
}

/// `space:load-doc-updates-since` entry: the full doc as one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDocUpdate {
    pub doc_id: String,
    #[serde(with = "b64")]
    pub update: Vec<u8>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePushed {
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBlob {
    pub key: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub mime: String,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireListedBlob {
    pub key: String,
    pub mime: String,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAwareness {
    #[serde(with = "b64")]
    pub awareness_update: Vec<u8>,
}

/// `space:load-doc-timestamps` reply, decoded.
pub fn decode_timestamps(raw: HashMap<String, i64>) -> Result<HashMap<String, Timestamp>> {
    raw.into_iter()
        .map(|(doc_id, micros)| {
            crate::storage::timestamp_from_micros(micros)
                .map(|ts| (doc_id.clone(), ts))
                .ok_or_else(|| StoreError::protocol("BAD_TIMESTAMP", format!("{}: {}", doc_id, micros)))
        })
        .collect()
}

pub fn encode_timestamps(clocks: &HashMap<String, Timestamp>) -> HashMap<String, i64> {
    clocks
        .iter()
        .map(|(doc_id, ts)| (doc_id.clone(), ts.timestamp_micros()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::now;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let frame = Frame::Request {
            id: 7,
            request: Request::PushDocUpdate {
                space_type: SpaceType::Workspace,
                space_id: "ws".into(),
                doc_id: "d1".into(),
                update: vec![1, 2, 3],
            },
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "id": 7,
                "request": {
                    "event": "space:push-doc-update",
                    "data": {
                        "spaceType": "workspace",
                        "spaceId": "ws",
                        "docId": "d1",
                        "update": "AQID"
                    }
                }
            })
        );
        assert_eq!(Frame::from_text(&frame.to_text().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_optional_state_vector_omitted() {
        let request = Request::LoadDoc {
            space_type: SpaceType::Userspace,
            space_id: "u".into(),
            doc_id: "d".into(),
            state_vector: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["data"].get("stateVector").is_none());

        let parsed: Request = serde_json::from_value(json!({
            "event": "space:load-doc",
            "data": {"spaceType": "userspace", "spaceId": "u", "docId": "d"}
        }))
        .unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.space(), (SpaceType::Userspace, "u"));
    }

    #[test]
    fn test_timestamps_are_micros() {
        let t = now();
        let event = ServerEvent::BroadcastDocUpdate {
            space_type: SpaceType::Workspace,
            space_id: "ws".into(),
            doc_id: "d1".into(),
            update: vec![9],
            timestamp: t,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["timestamp"], json!(t.timestamp_micros()));
        let back: ServerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_error_ack_becomes_protocol_error() {
        let ack: AckPayload = serde_json::from_value(json!({
            "error": {"name": "SPACE_NOT_JOINED", "message": "join first"}
        }))
        .unwrap();
        match ack.into_result::<serde_json::Value>() {
            Err(StoreError::Protocol { name, message }) => {
                assert_eq!(name, "SPACE_NOT_JOINED");
                assert_eq!(message, "join first");
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_store_errors_map_to_names() {
        let ack = AckPayload::from_error(&StoreError::Integrity("bad bytes".into()));
        assert!(matches!(ack, AckPayload::Error(WireError { ref name, .. }) if name == "INTEGRITY"));

        let ack = AckPayload::from_error(&StoreError::protocol("CUSTOM", "m"));
        assert_eq!(ack, AckPayload::error("CUSTOM", "m"));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            Frame::from_text("{\"type\":\"request\"}"),
            Err(StoreError::Protocol { .. })
        ));
        assert!(Frame::from_text("not json").is_err());
    }

    #[test]
    fn test_timestamp_maps_round_trip() {
        let mut clocks = HashMap::new();
        clocks.insert("d1".to_string(), now());
        assert_eq!(decode_timestamps(encode_timestamps(&clocks)).unwrap(), clocks);
    }
}
