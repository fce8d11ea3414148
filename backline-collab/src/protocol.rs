//! Messages exchanged between collaborators.
//!
//! Two layers:
//! - [`BroadcastMessage`]: what a session publishes to the other members
//!   of a document channel. Field values are arbitrary JSON, so the message
//!   travels as JSON bytes.
//! - [`Frame`]: the relay's wire envelope, bincode-encoded. One WebSocket
//!   carries one channel membership:
//!
//! ```text
//! client                          relay
//!   │ ── Join{channel, member} ──► │
//!   │ ◄──────── Joined ─────────── │
//!   │ ── Publish{json} ──────────► │ ──► Event{sender, json} to others
//!   │ ── Track{user} ────────────► │ ──► Presence{roster} to everyone
//!   │ ◄──────── Ping / Pong ─────► │
//! ```

use backline_core::{FieldMap, PresenceUser, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Payload published on a document channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// Fields the sender just persisted, with the version the store assigned.
    FieldUpdate {
        fields: FieldMap,
        version: u64,
        saved_at: DateTime<Utc>,
        author: UserId,
    },
    CursorMove {
        user_id: UserId,
        field: String,
        cursor: u32,
    },
    SelectionChange {
        user_id: UserId,
        field: Option<String>,
        start: u32,
        end: u32,
    },
    /// Ask the other members for their current state, sent after a resume.
    SyncRequest { user_id: UserId },
    /// Answer to a [`BroadcastMessage::SyncRequest`]: the sender's last
    /// saved state.
    SyncResponse {
        requester: UserId,
        fields: FieldMap,
        version: u64,
    },
}

impl BroadcastMessage {
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::FieldUpdate { .. } => "field_update",
            BroadcastMessage::CursorMove { .. } => "cursor_move",
            BroadcastMessage::SelectionChange { .. } => "selection_change",
            BroadcastMessage::SyncRequest { .. } => "sync_request",
            BroadcastMessage::SyncResponse { .. } => "sync_response",
        }
    }
}

/// One membership in a channel. A user with two open windows is two members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberInfo {
    pub member_id: Uuid,
    pub user_id: UserId,
    pub display_name: String,
}

impl MemberInfo {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            member_id: Uuid::new_v4(),
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Relay wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Join { channel: String, member: MemberInfo },
    Joined,
    Publish { payload: Vec<u8> },
    Track { user: PresenceUser },
    Untrack,
    Event { sender: MemberInfo, payload: Vec<u8> },
    Presence { roster: Vec<PresenceUser> },
    Error { message: String },
    Ping,
    Pong,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    pub fn publish(message: &BroadcastMessage) -> Result<Self, ProtocolError> {
        Ok(Frame::Publish {
            payload: message.to_payload()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_update_payload() {
        let mut fields = FieldMap::new();
        fields.insert("inputs".into(), json!([{"ch": 1, "name": "Kick"}]));
        let msg = BroadcastMessage::FieldUpdate {
            fields,
            version: 7,
            saved_at: Utc::now(),
            author: Uuid::new_v4(),
        };

        let bytes = msg.to_payload().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"field_update\""));
        assert_eq!(BroadcastMessage::from_payload(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_frame_carries_json_payload() {
        let msg = BroadcastMessage::SyncRequest {
            user_id: Uuid::new_v4(),
        };
        let frame = Frame::publish(&msg).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::Publish { payload } => {
                assert_eq!(BroadcastMessage::from_payload(&payload).unwrap(), msg);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_presence_frame() {
        let user = PresenceUser::new(Uuid::new_v4(), "ana@venue.example");
        let frame = Frame::Presence {
            roster: vec![user.clone()],
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, Frame::Presence { roster: vec![user] });
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Frame::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(BroadcastMessage::from_payload(b"{\"type\":\"nope\"}").is_err());
    }
}
