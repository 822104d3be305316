use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::rooms::RoomId;
use crate::error::SessionError;
use crate::protocol::{MemberInfo, ServerMessage};
use crate::ConnId;

/// Channel feeding a connection's WebSocket writer task. Fan-out shares one
/// allocation across every recipient.
pub type Outbound = mpsc::UnboundedSender<Arc<ServerMessage>>;

/// Per-connection metadata owned by the registry.
#[derive(Debug, Clone)]
struct ConnectionEntry {
    display_name: Option<String>,
    current_room: Option<RoomId>,
    outbound: Outbound,
    connected_at: DateTime<Utc>,
}

/// Snapshot of a connection's identity, handed out by `lookup` and `remove`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub connection_id: ConnId,
    pub display_name: Option<String>,
    pub current_room: Option<RoomId>,
}

impl Identity {
    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            connection_id: self.connection_id.clone(),
            display_name: self.display_name.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Returns `false` (and keeps the existing entry) when already registered.
    pub fn register(&mut self, conn_id: ConnId, outbound: Outbound) -> bool {
        if self.entries.contains_key(&conn_id) {
            return false;
        }
        self.entries.insert(
            conn_id,
            ConnectionEntry {
                display_name: None,
                current_room: None,
                outbound,
                connected_at: Utc::now(),
            },
        );
        true
    }

    pub fn set_identity(&mut self, conn_id: &ConnId, display_name: &str) -> Result<(), SessionError> {
        if display_name.is_empty() {
            return Err(SessionError::InvalidIdentity);
        }
        let entry = self
            .entries
            .get_mut(conn_id)
            .ok_or(SessionError::InvalidIdentity)?;
        entry.display_name = Some(display_name.to_string());
        Ok(())
    }

    pub fn set_room(&mut self, conn_id: &ConnId, room: Option<RoomId>) -> Result<(), SessionError> {
        let entry = self
            .entries
            .get_mut(conn_id)
            .ok_or_else(|| SessionError::NotFound(conn_id.clone()))?;
        entry.current_room = room;
        Ok(())
    }

    pub fn lookup(&self, conn_id: &ConnId) -> Result<Identity, SessionError> {
        self.entries
            .get(conn_id)
            .map(|entry| identity_of(conn_id, entry))
            .ok_or_else(|| SessionError::NotFound(conn_id.clone()))
    }

    /// Deletes the entry and returns its last-known identity. A second call
    /// for the same id yields `NotFound`.
    pub fn remove(&mut self, conn_id: &ConnId) -> Result<Identity, SessionError> {
        self.entries
            .remove(conn_id)
            .map(|entry| identity_of(conn_id, &entry))
            .ok_or_else(|| SessionError::NotFound(conn_id.clone()))
    }

    pub fn contains(&self, conn_id: &ConnId) -> bool {
        self.entries.contains_key(conn_id)
    }

    pub fn connected_at(&self, conn_id: &ConnId) -> Option<DateTime<Utc>> {
        self.entries.get(conn_id).map(|entry| entry.connected_at)
    }

    /// Hand `msg` to the connection's transport. Fire-and-forget: returns
    /// `false` if the connection is unknown or its writer has gone away.
    pub fn send(&self, conn_id: &ConnId, msg: ServerMessage) -> bool {
        self.send_shared(conn_id, &Arc::new(msg))
    }

    /// Like [`send`](Self::send) but hands over another reference to an
    /// already shared message.
    pub fn send_shared(&self, conn_id: &ConnId, msg: &Arc<ServerMessage>) -> bool {
        match self.entries.get(conn_id) {
            Some(entry) => entry.outbound.send(Arc::clone(msg)).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Identity> + '_ {
        self.entries
            .iter()
            .map(|(conn_id, entry)| identity_of(conn_id, entry))
    }
}

fn identity_of(conn_id: &ConnId, entry: &ConnectionEntry) -> Identity {
    Identity {
        connection_id: conn_id.clone(),
        display_name: entry.display_name.clone(),
        current_room: entry.current_room.clone(),
    }
}
