//! Payload-agnostic message relay.
//!
//! The router only decides who receives a message and stamps sender
//! attribution on the kinds that carry it. Payloads pass through untouched.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;

use crate::error::SessionError;
use crate::protocol::ServerMessage;
use crate::state::SharedSession;
use crate::ConnId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    /// Every member of the sender's room except the sender.
    RoomExceptSender,
    /// Every member including the sender, who ignores its own copy.
    RoomIncludingSender,
    DirectToConnection(ConnId),
}

/// A relayable message, one variant per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Signal(Value),
    DrawLine(Value),
    DrawText(Value),
    ClearBoard(Value),
    BoardSnapshotRequest(Value),
    BoardSnapshot(Value),
    ChatMessage(String),
    ChatFile(Value),
    PrivateMessage(String),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::DrawLine(_) => "draw-line",
            Self::DrawText(_) => "draw-text",
            Self::ClearBoard(_) => "clear-board",
            Self::BoardSnapshotRequest(_) => "board-snapshot-request",
            Self::BoardSnapshot(_) => "board-snapshot",
            Self::ChatMessage(_) => "chat-message",
            Self::ChatFile(_) => "chat-file",
            Self::PrivateMessage(_) => "private-message",
        }
    }

    fn validate(&self) -> Result<(), SessionError> {
        match self {
            Self::ChatMessage(text) | Self::PrivateMessage(text) if text.trim().is_empty() => {
                Err(SessionError::invalid(format!("{} text must not be empty", self.kind())))
            }
            _ => Ok(()),
        }
    }

    fn attribute(self, from: &ConnId, from_name: &str, at: DateTime<Utc>) -> ServerMessage {
        match self {
            Self::Signal(payload) => ServerMessage::Signal {
                from: from.clone(),
                from_name: from_name.to_string(),
                payload,
            },
            Self::DrawLine(payload) => ServerMessage::DrawLine { payload },
            Self::DrawText(payload) => ServerMessage::DrawText { payload },
            Self::ClearBoard(payload) => ServerMessage::ClearBoard { payload },
            Self::BoardSnapshotRequest(payload) => ServerMessage::BoardSnapshotRequest {
                from: from.clone(),
                payload,
            },
            Self::BoardSnapshot(payload) => ServerMessage::BoardSnapshot {
                from: from.clone(),
                payload,
            },
            Self::ChatMessage(text) => ServerMessage::ChatMessage {
                sender_id: from.clone(),
                from_name: from_name.to_string(),
                text,
                timestamp: at,
            },
            Self::ChatFile(payload) => ServerMessage::ChatFile {
                sender_id: from.clone(),
                from_name: from_name.to_string(),
                payload,
                timestamp: at,
            },
            Self::PrivateMessage(text) => ServerMessage::PrivateMessage {
                from: from.clone(),
                from_name: from_name.to_string(),
                text,
                timestamp: at,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Handed to this many recipient transports.
    Delivered { recipients: usize },
    /// Sender has no room (or is already gone); nothing was sent.
    Dropped,
}

#[derive(Clone)]
pub struct RelayRouter {
    session: SharedSession,
}

impl RelayRouter {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    pub async fn relay(
        &self,
        from: &ConnId,
        envelope: Envelope,
        target: RelayTarget,
    ) -> Result<RelayOutcome, SessionError> {
        envelope.validate()?;

        let st = self.session.lock().await;
        let Ok(sender) = st.registry.lookup(from) else {
            debug!("Dropping {} from unregistered {}", envelope.kind(), from);
            return Ok(RelayOutcome::Dropped);
        };
        let Some(room_id) = sender.current_room.as_ref() else {
            debug!("Dropping {} from {}: not in a room", envelope.kind(), from);
            return Ok(RelayOutcome::Dropped);
        };

        let recipients = match &target {
            RelayTarget::RoomExceptSender => st.rooms.other_members_of(room_id, from),
            RelayTarget::RoomIncludingSender => st.rooms.members_of(room_id),
            RelayTarget::DirectToConnection(to) => {
                if !st.registry.contains(to) {
                    return Err(SessionError::TargetUnreachable(to.clone()));
                }
                vec![to.clone()]
            }
        };

        let kind = envelope.kind();
        let confirm = matches!(envelope, Envelope::PrivateMessage(_));
        let now = Utc::now();
        let from_name = sender.display_name.as_deref().unwrap_or_default();
        let msg = envelope.attribute(from, from_name, now);
        let delivered = st.deliver(&recipients, msg);

        if delivered < recipients.len() {
            warn!(
                "Relay of {} in room {} reached {}/{} recipients",
                kind,
                room_id,
                delivered,
                recipients.len()
            );
        } else {
            debug!("Relayed {} from {} to {} recipient(s)", kind, from, delivered);
        }

        if confirm && delivered > 0 {
            if let RelayTarget::DirectToConnection(to) = target {
                st.registry.send(
                    from,
                    ServerMessage::PrivateMessageSent {
                        target: to,
                        timestamp: now,
                    },
                );
            }
        }

        Ok(RelayOutcome::Delivered {
            recipients: delivered,
        })
    }
}
