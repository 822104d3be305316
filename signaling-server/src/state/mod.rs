pub mod registry;
pub mod rooms;

pub use registry::{ConnectionRegistry, Outbound};
pub use rooms::{RoomDirectory, RoomId};

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::coordinator::{RoomPolicy, SessionCoordinator};
use crate::protocol::{MemberInfo, ServerMessage};
use crate::relay::RelayRouter;
use crate::ConnId;

/// Registry and directory behind one lock.
///
/// Every transition that touches both (join, leave, disconnect) happens under
/// a single guard, so no reader can observe a connection whose room pointer
/// and room membership disagree.
#[derive(Debug, Default)]
pub struct SessionState {
    pub registry: ConnectionRegistry,
    pub rooms: RoomDirectory,
}

pub type SharedSession = Arc<Mutex<SessionState>>;

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSession {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Fan `msg` out to `recipients`. Returns how many transports accepted it.
    ///
    /// Recipients share one `Arc`; the payload is never copied per member.
    pub fn deliver(&self, recipients: &[ConnId], msg: ServerMessage) -> usize {
        let msg = Arc::new(msg);
        recipients
            .iter()
            .filter(|conn_id| self.registry.send_shared(conn_id, &msg))
            .count()
    }

    /// Presence records for `conn_ids`, skipping any that vanished.
    pub fn member_infos(&self, conn_ids: &[ConnId]) -> Vec<MemberInfo> {
        conn_ids
            .iter()
            .filter_map(|conn_id| self.registry.lookup(conn_id).ok())
            .map(|identity| identity.member_info())
            .collect()
    }

    /// `current_room == R` iff the connection is in `R`'s member set.
    pub fn is_consistent(&self) -> bool {
        let pointers_match = self.registry.iter().all(|identity| match &identity.current_room {
            Some(room) => self.rooms.contains(room, &identity.connection_id),
            None => true,
        });
        let members_match = self.rooms.iter().all(|(room, members)| {
            !members.is_empty()
                && members.iter().all(|conn_id| {
                    self.registry
                        .lookup(conn_id)
                        .is_ok_and(|identity| identity.current_room.as_ref() == Some(room))
                })
        });
        pointers_match && members_match
    }
}

/// Main application state shared by every connection task.
pub struct AppState {
    pub config: ServerConfig,
    pub coordinator: SessionCoordinator,
    pub router: RelayRouter,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let session = SessionState::shared();
        let policy = RoomPolicy {
            open_creation: config.open_room_creation,
        };
        Self {
            coordinator: SessionCoordinator::new(session.clone(), policy),
            router: RelayRouter::new(session),
            config,
        }
    }
}
