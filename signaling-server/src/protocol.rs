use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, SessionError};
use crate::state::rooms::RoomId;
use crate::ConnId;

// ============================================
// Client -> Server
// ============================================

/// How a `join-room` request treats a room that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinIntent {
    /// Create the room on demand; joining an existing one is fine too.
    #[serde(rename = "create")]
    Create,
    /// The room must already have members.
    #[serde(rename = "join", alias = "join-existing")]
    JoinExisting,
}

/// Frames sent by participants. Payloads are opaque to the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        display_name: String,
        intent: JoinIntent,
    },
    LeaveRoom,
    /// Offer/answer/candidate blob. Without `target` it goes to the whole room.
    Signal {
        payload: Value,
        #[serde(default)]
        target: Option<ConnId>,
    },
    DrawLine {
        payload: Value,
    },
    DrawText {
        payload: Value,
    },
    ClearBoard {
        #[serde(default)]
        payload: Value,
    },
    BoardSnapshotRequest {
        #[serde(default)]
        payload: Value,
    },
    BoardSnapshot {
        payload: Value,
        target: ConnId,
    },
    ChatMessage {
        text: String,
    },
    ChatFile {
        payload: Value,
    },
    PrivateMessage {
        text: String,
        target: ConnId,
    },
}

// ============================================
// Server -> Client
// ============================================

/// Presence record for one room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub connection_id: ConnId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        connection_id: ConnId,
    },
    /// Sent to the joining connection with everyone else already present.
    RoomJoined {
        room_id: RoomId,
        members: Vec<MemberInfo>,
    },
    RoomLeft {
        room_id: RoomId,
    },
    MemberJoined {
        room_id: RoomId,
        member: MemberInfo,
    },
    MemberLeft {
        room_id: RoomId,
        member: MemberInfo,
    },
    Signal {
        from: ConnId,
        from_name: String,
        payload: Value,
    },
    DrawLine {
        payload: Value,
    },
    DrawText {
        payload: Value,
    },
    ClearBoard {
        payload: Value,
    },
    BoardSnapshotRequest {
        from: ConnId,
        payload: Value,
    },
    BoardSnapshot {
        from: ConnId,
        payload: Value,
    },
    ChatMessage {
        sender_id: ConnId,
        from_name: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    ChatFile {
        sender_id: ConnId,
        from_name: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    PrivateMessage {
        from: ConnId,
        from_name: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// The private message was handed to the target's transport. Says
    /// nothing about whether the target read it.
    PrivateMessageSent {
        target: ConnId,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn welcome(connection_id: impl Into<ConnId>) -> Self {
        Self::Welcome {
            connection_id: connection_id.into(),
        }
    }

    /// `None` for errors that are never shown to a client.
    pub fn from_error(err: &SessionError) -> Option<Self> {
        err.code().map(|code| Self::Error {
            code,
            message: err.to_string(),
        })
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::Error {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_room_with_both_intents() {
        let create: ClientMessage = serde_json::from_value(json!({
            "type": "join-room", "room_id": "abc123", "display_name": "Alice", "intent": "create"
        }))
        .unwrap();
        assert_eq!(
            create,
            ClientMessage::JoinRoom {
                room_id: "abc123".into(),
                display_name: "Alice".into(),
                intent: JoinIntent::Create,
            }
        );

        for intent in ["join", "join-existing"] {
            let msg: ClientMessage = serde_json::from_value(json!({
                "type": "join-room", "room_id": "abc123", "display_name": "Bob", "intent": intent
            }))
            .unwrap();
            assert!(matches!(
                msg,
                ClientMessage::JoinRoom { intent: JoinIntent::JoinExisting, .. }
            ));
        }
    }

    #[test]
    fn join_room_without_intent_is_rejected() {
        let res = serde_json::from_value::<ClientMessage>(json!({
            "type": "join-room", "room_id": "abc", "display_name": "Bob"
        }));
        assert!(res.is_err());
    }

    #[test]
    fn signal_payload_is_kept_verbatim() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "signal",
            "payload": { "offer": { "sdp": "v=0...", "type": "offer" }, "extra": [1, 2] }
        }))
        .unwrap();
        match msg {
            ClientMessage::Signal { payload, target } => {
                assert_eq!(target, None);
                assert_eq!(payload["offer"]["sdp"], "v=0...");
                assert_eq!(payload["extra"], json!([1, 2]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn clear_board_needs_no_payload() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"clear-board"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ClearBoard { payload: Value::Null });
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"leave-room"}"#).unwrap();
        assert_eq!(msg, ClientMessage::LeaveRoom);
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn server_messages_use_kebab_case_tags() {
        let room = RoomId::parse("abcdef").unwrap();
        let value = serde_json::to_value(ServerMessage::MemberJoined {
            room_id: room,
            member: MemberInfo {
                connection_id: "c1".into(),
                display_name: "Alice".into(),
            },
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "member-joined",
                "room_id": "ABCDEF",
                "member": { "connection_id": "c1", "display_name": "Alice" }
            })
        );
    }

    #[test]
    fn error_frames_carry_code_and_message() {
        let err = SessionError::invalid("missing room id");
        let value = serde_json::to_value(ServerMessage::from_error(&err).unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "invalid-request");
        assert_eq!(value["message"], "invalid request: missing room id");

        assert!(ServerMessage::from_error(&SessionError::NotFound("c1".into())).is_none());
    }
}
