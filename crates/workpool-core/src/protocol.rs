//! Wire protocol shared by clients, the coordinator and workers.
//!
//! Every message is a single JSON object discriminated by its `op` field.
//! Clients only ever send [`ClientMessage`]s; workers and the coordinator
//! only ever emit [`ServerMessage`]s. The coordinator forwards a client's
//! `cancel` to a worker verbatim, so the worker-bound direction of a job
//! channel carries [`ClientMessage`] as well.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier of a job. Assigned by the coordinator, starting at 1.
pub type JobId = u64;

/// Errors produced while decoding a protocol message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("message is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("message has no 'op' field")]
    MissingOp,

    #[error("unrecognized op: {0}")]
    UnknownOp(String),

    #[error("malformed '{op}' message: {source}")]
    Malformed {
        op: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Requests sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Queue a new job.
    Start,
    /// Cancel one job, or every job in flight when `id` is absent.
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<JobId>,
    },
}

/// Aggregate pool counters, broadcast as `{"op": "pool", ...}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Jobs that finished successfully over the coordinator's lifetime.
    pub completed: u64,
    /// Jobs currently running.
    pub active: u64,
    /// Jobs accepted but not yet started.
    pub queued: u64,
}

/// Events emitted by workers and republished by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Start { id: JobId, max: u64 },
    Progress { id: JobId, value: u64, max: u64 },
    Finish { id: JobId },
    Error { id: JobId },
    Cancel { id: JobId },
    #[serde(rename = "pool")]
    Status(PoolStatus),
}

impl ServerMessage {
    /// The job this message refers to, or `None` for pool status.
    pub fn job_id(&self) -> Option<JobId> {
        match *self {
            Self::Start { id, .. }
            | Self::Progress { id, .. }
            | Self::Finish { id }
            | Self::Error { id }
            | Self::Cancel { id } => Some(id),
            Self::Status(_) => None,
        }
    }

    /// Whether this is one of the three messages that end a job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finish { .. } | Self::Error { .. } | Self::Cancel { .. }
        )
    }
}

/// A closed family of protocol messages sharing one `op` namespace.
pub trait Message: Serialize + DeserializeOwned {
    /// Every `op` value this family accepts.
    const OPS: &'static [&'static str];

    /// The `op` value of this message.
    fn op(&self) -> &'static str;

    /// Encode to a JSON string.
    fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Message for ClientMessage {
    const OPS: &'static [&'static str] = &["start", "cancel"];

    fn op(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Cancel { .. } => "cancel",
        }
    }
}

impl Message for ServerMessage {
    const OPS: &'static [&'static str] = &["start", "progress", "finish", "error", "cancel", "pool"];

    fn op(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Progress { .. } => "progress",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
            Self::Cancel { .. } => "cancel",
            Self::Status(_) => "pool",
        }
    }
}

/// Decode a message from JSON text.
pub fn decode<M: Message>(text: &str) -> Result<M, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    decode_value(value)
}

/// Decode a message from an already-parsed JSON value.
///
/// The `op` field is checked against [`Message::OPS`] before the rest of
/// the payload is validated, so errors always name the offending op.
pub fn decode_value<M: Message>(value: Value) -> Result<M, ProtocolError> {
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject(value.to_string()));
    };
    let op = match object.get("op") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingOp),
        Some(Value::String(op)) => op.clone(),
        Some(other) => return Err(ProtocolError::UnknownOp(other.to_string())),
    };
    if !M::OPS.contains(&op.as_str()) {
        return Err(ProtocolError::UnknownOp(op));
    }
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { op, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_server_messages() -> Vec<ServerMessage> {
        vec![
            ServerMessage::Start { id: 1, max: 120 },
            ServerMessage::Progress {
                id: 1,
                value: 40,
                max: 120,
            },
            ServerMessage::Finish { id: 2 },
            ServerMessage::Error { id: 3 },
            ServerMessage::Cancel { id: 4 },
            ServerMessage::Status(PoolStatus {
                completed: 5,
                active: 2,
                queued: 1,
            }),
        ]
    }

    #[test]
    fn client_start_wire_shape() {
        let v = serde_json::to_value(ClientMessage::Start).unwrap();
        assert_eq!(v, json!({"op": "start"}));
    }

    #[test]
    fn client_cancel_without_id_omits_field() {
        let v = serde_json::to_value(ClientMessage::Cancel { id: None }).unwrap();
        assert_eq!(v, json!({"op": "cancel"}));
    }

    #[test]
    fn client_cancel_accepts_null_and_missing_id() {
        let a: ClientMessage = decode(r#"{"op":"cancel","id":null}"#).unwrap();
        let b: ClientMessage = decode(r#"{"op":"cancel"}"#).unwrap();
        assert_eq!(a, ClientMessage::Cancel { id: None });
        assert_eq!(b, ClientMessage::Cancel { id: None });
    }

    #[test]
    fn client_cancel_with_id() {
        let msg: ClientMessage = decode(r#"{"op":"cancel","id":7}"#).unwrap();
        assert_eq!(msg, ClientMessage::Cancel { id: Some(7) });
    }

    #[test]
    fn pool_status_wire_shape() {
        let msg = ServerMessage::Status(PoolStatus {
            completed: 1,
            active: 0,
            queued: 0,
        });
        let v = serde_json::to_value(msg).unwrap();
        assert_eq!(
            v,
            json!({"op": "pool", "completed": 1, "active": 0, "queued": 0})
        );
    }

    #[test]
    fn progress_wire_shape() {
        let msg = ServerMessage::Progress {
            id: 3,
            value: 10,
            max: 90,
        };
        let v = serde_json::to_value(msg).unwrap();
        assert_eq!(v, json!({"op": "progress", "id": 3, "value": 10, "max": 90}));
    }

    #[test]
    fn server_messages_round_trip() {
        for msg in all_server_messages() {
            let text = msg.encode().unwrap();
            let back: ServerMessage = decode(&text).unwrap();
            assert_eq!(back, msg, "round trip failed for {text}");
        }
    }

    #[test]
    fn client_messages_round_trip() {
        for msg in [
            ClientMessage::Start,
            ClientMessage::Cancel { id: None },
            ClientMessage::Cancel { id: Some(12) },
        ] {
            let text = msg.encode().unwrap();
            let back: ClientMessage = decode(&text).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn op_matches_encoded_tag() {
        for msg in all_server_messages() {
            let v = serde_json::to_value(msg).unwrap();
            assert_eq!(v["op"], msg.op());
            assert!(ServerMessage::OPS.contains(&msg.op()));
        }
    }

    #[test]
    fn unknown_op_is_named() {
        let err = decode::<ClientMessage>(r#"{"op":"explode"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOp(ref op) if op == "explode"));
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn server_only_op_is_unknown_to_clients() {
        let err = decode::<ClientMessage>(r#"{"op":"progress","id":1,"value":1,"max":2}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOp(ref op) if op == "progress"));
    }

    #[test]
    fn non_string_op_is_unknown() {
        let err = decode::<ClientMessage>(r#"{"op":5}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOp(ref op) if op == "5"));
    }

    #[test]
    fn missing_op_is_rejected() {
        let err = decode::<ClientMessage>(r#"{"id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingOp));
    }

    #[test]
    fn malformed_payload_names_op() {
        let err = decode::<ClientMessage>(r#"{"op":"cancel","id":"seven"}"#).unwrap_err();
        match err {
            ProtocolError::Malformed { op, .. } => assert_eq!(op, "cancel"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn server_message_missing_field_is_malformed() {
        let err = decode::<ServerMessage>(r#"{"op":"start","id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { ref op, .. } if op == "start"));
    }

    #[test]
    fn non_object_and_garbage_are_rejected() {
        assert!(matches!(
            decode::<ClientMessage>("[1,2]").unwrap_err(),
            ProtocolError::NotAnObject(_)
        ));
        assert!(matches!(
            decode::<ClientMessage>("not json").unwrap_err(),
            ProtocolError::InvalidJson(_)
        ));
    }

    #[test]
    fn job_id_and_terminal_classification() {
        assert_eq!(ServerMessage::Finish { id: 9 }.job_id(), Some(9));
        assert_eq!(ServerMessage::Status(PoolStatus::default()).job_id(), None);
        assert!(ServerMessage::Cancel { id: 1 }.is_terminal());
        assert!(ServerMessage::Error { id: 1 }.is_terminal());
        assert!(!ServerMessage::Start { id: 1, max: 3 }.is_terminal());
    }
}
