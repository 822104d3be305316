use serde::Serialize;

use crate::state::rooms::RoomId;
use crate::ConnId;

/// Everything that can go wrong while admitting, routing or cleaning up a
/// connection. None of these are fatal to the server or to other sessions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Malformed or missing required fields. Rejected before any state change.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A must-exist join named a room with no members.
    #[error("room {0} does not exist or the meeting has ended")]
    RoomNotFound(RoomId),

    /// Direct relay to a connection that is not registered.
    #[error("connection {0} is not reachable")]
    TargetUnreachable(ConnId),

    #[error("display name must not be empty")]
    InvalidIdentity,

    /// Lookup against a connection that has already been removed.
    #[error("connection {0} not found")]
    NotFound(ConnId),
}

impl SessionError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Wire code for errors the sender gets to see. Internal races have none.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::InvalidRequest(_) => Some(ErrorCode::InvalidRequest),
            Self::RoomNotFound(_) => Some(ErrorCode::RoomNotFound),
            Self::TargetUnreachable(_) => Some(ErrorCode::TargetUnreachable),
            Self::InvalidIdentity | Self::NotFound(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidRequest,
    RoomNotFound,
    TargetUnreachable,
}
