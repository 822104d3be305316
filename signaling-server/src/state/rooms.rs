use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::SessionError;
use crate::ConnId;

pub const MAX_ROOM_ID_LEN: usize = 64;

/// Case-normalized room identifier.
///
/// Room codes are shared verbally or pasted, so `abcdef`, ` ABCDEF ` and
/// `AbCdEf` all name the same room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(SessionError::invalid("room id must not be empty"));
        }
        // Uppercasing may expand a character (`ß` -> `SS`), so measure after.
        if normalized.chars().count() > MAX_ROOM_ID_LEN {
            return Err(SessionError::invalid(format!(
                "room id longer than {} characters",
                MAX_ROOM_ID_LEN
            )));
        }
        if normalized.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SessionError::invalid("room id contains whitespace"));
        }
        Ok(Self(normalized))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room id -> connections currently joined, in join order.
///
/// A room is present exactly while it has members; the last `leave` deletes
/// the entry.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, Vec<ConnId>>,
}

impl RoomDirectory {
    /// Add `conn_id` to `room_id`, creating the room if absent. Returns `true`
    /// when this call created the room.
    pub fn join(&mut self, room_id: &RoomId, conn_id: &ConnId) -> bool {
        let created = !self.rooms.contains_key(room_id);
        let members = self.rooms.entry(room_id.clone()).or_insert_with(Vec::new);
        if !members.contains(conn_id) {
            members.push(conn_id.clone());
        }
        created
    }

    /// Remove `conn_id` from `room_id`. Returns `true` when the room became
    /// empty and was deleted.
    pub fn leave(&mut self, room_id: &RoomId, conn_id: &ConnId) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        members.retain(|c| c != conn_id);
        if members.is_empty() {
            self.rooms.remove(room_id);
            return true;
        }
        false
    }

    pub fn exists(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Empty when the room is absent.
    pub fn members_of(&self, room_id: &RoomId) -> Vec<ConnId> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub fn other_members_of(&self, room_id: &RoomId, excluding: &ConnId) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().filter(|c| *c != excluding).cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: &RoomId, conn_id: &ConnId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.contains(conn_id))
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, Vec::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoomId, &Vec<ConnId>)> {
        self.rooms.iter()
    }
}
