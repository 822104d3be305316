//! Room admission state machine.
//!
//! A connection is either unjoined or joined to exactly one room. Every
//! transition runs under the session lock and sends its notifications before
//! releasing it, so a room switch always reaches the old room's members
//! (`member-left`) before the new room's members (`member-joined`).

use log::{debug, info};
use serde::Serialize;

use crate::error::SessionError;
use crate::protocol::{JoinIntent, MemberInfo, ServerMessage};
use crate::state::{Outbound, RoomId, SessionState, SharedSession};
use crate::ConnId;

pub const MAX_DISPLAY_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomPolicy {
    /// Must-exist joins create absent rooms instead of failing.
    pub open_creation: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub room_id: RoomId,
    /// Other members at the moment of joining, in join order.
    pub members: Vec<MemberInfo>,
    pub created: bool,
}

/// What a leave or disconnect did to the room the connection was in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub member: MemberInfo,
    /// Members that were sent `member-left`.
    pub notified: Vec<ConnId>,
    pub room_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomStatus {
    pub exists: bool,
    pub member_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub connections: usize,
    pub rooms: usize,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    session: SharedSession,
    policy: RoomPolicy,
}

impl SessionCoordinator {
    pub fn new(session: SharedSession, policy: RoomPolicy) -> Self {
        Self { session, policy }
    }

    /// Register a fresh connection and greet it with its id.
    pub async fn connect(&self, conn_id: ConnId, outbound: Outbound) -> bool {
        let mut st = self.session.lock().await;
        if !st.registry.register(conn_id.clone(), outbound) {
            return false;
        }
        st.registry.send(&conn_id, ServerMessage::welcome(conn_id.clone()));
        true
    }

    /// Join `room_id`, creating it if nobody is there yet.
    pub async fn create_room(
        &self,
        conn_id: &ConnId,
        room_id: &str,
        display_name: &str,
    ) -> Result<Admission, SessionError> {
        self.admit(conn_id, room_id, display_name, false).await
    }

    /// Join `room_id` only if it already has members (unless the policy
    /// allows open creation).
    pub async fn join_existing(
        &self,
        conn_id: &ConnId,
        room_id: &str,
        display_name: &str,
    ) -> Result<Admission, SessionError> {
        self.admit(conn_id, room_id, display_name, !self.policy.open_creation)
            .await
    }

    pub async fn join(
        &self,
        conn_id: &ConnId,
        room_id: &str,
        display_name: &str,
        intent: JoinIntent,
    ) -> Result<Admission, SessionError> {
        match intent {
            JoinIntent::Create => self.create_room(conn_id, room_id, display_name).await,
            JoinIntent::JoinExisting => self.join_existing(conn_id, room_id, display_name).await,
        }
    }

    async fn admit(
        &self,
        conn_id: &ConnId,
        raw_room: &str,
        raw_name: &str,
        must_exist: bool,
    ) -> Result<Admission, SessionError> {
        let room_id = RoomId::parse(raw_room)?;
        let display_name = validate_display_name(raw_name)?;

        let mut st = self.session.lock().await;
        let identity = st.registry.lookup(conn_id)?;

        if must_exist && !st.rooms.exists(&room_id) {
            info!("Rejected join of {} into missing room {}", conn_id, room_id);
            return Err(SessionError::RoomNotFound(room_id));
        }

        if identity.current_room.as_ref() == Some(&room_id) {
            return rejoin(&mut st, conn_id, room_id, &display_name, identity.display_name);
        }

        if identity.current_room.is_some() {
            depart(&mut st, conn_id);
        }

        st.registry.set_identity(conn_id, &display_name)?;
        st.registry.set_room(conn_id, Some(room_id.clone()))?;
        let created = st.rooms.join(&room_id, conn_id);

        let others = st.rooms.other_members_of(&room_id, conn_id);
        let members = st.member_infos(&others);
        st.registry.send(
            conn_id,
            ServerMessage::RoomJoined {
                room_id: room_id.clone(),
                members: members.clone(),
            },
        );
        st.deliver(
            &others,
            ServerMessage::MemberJoined {
                room_id: room_id.clone(),
                member: MemberInfo {
                    connection_id: conn_id.clone(),
                    display_name: display_name.clone(),
                },
            },
        );

        if created {
            info!("Room {} created by {} ({})", room_id, display_name, conn_id);
        } else {
            info!(
                "User {} ({}) joined room {} with {} other member(s)",
                display_name,
                conn_id,
                room_id,
                others.len()
            );
        }

        debug_assert!(st.is_consistent());
        Ok(Admission {
            room_id,
            members,
            created,
        })
    }

    /// Leave the current room but stay registered. No-op when roomless.
    pub async fn leave(&self, conn_id: &ConnId) -> Option<Departure> {
        let mut st = self.session.lock().await;
        let departure = depart(&mut st, conn_id)?;
        debug_assert!(st.is_consistent());
        st.registry.send(
            conn_id,
            ServerMessage::RoomLeft {
                room_id: departure.room_id.clone(),
            },
        );
        Some(departure)
    }

    /// Leave the current room (if any) and forget the connection.
    ///
    /// A repeated call for the same id returns `NotFound` and sends nothing.
    pub async fn disconnect(&self, conn_id: &ConnId) -> Result<Option<Departure>, SessionError> {
        let mut st = self.session.lock().await;
        if !st.registry.contains(conn_id) {
            return Err(SessionError::NotFound(conn_id.clone()));
        }
        let departure = depart(&mut st, conn_id);
        if let Some(connected_at) = st.registry.connected_at(conn_id) {
            let secs = (chrono::Utc::now() - connected_at).num_seconds();
            info!("Connection {} disconnected after {}s", conn_id, secs);
        }
        st.registry.remove(conn_id)?;
        debug_assert!(st.is_consistent());
        Ok(departure)
    }

    pub async fn room_status(&self, room_id: &RoomId) -> RoomStatus {
        let st = self.session.lock().await;
        RoomStatus {
            exists: st.rooms.exists(room_id),
            member_count: st.rooms.member_count(room_id),
        }
    }

    pub async fn stats(&self) -> SessionStats {
        let st = self.session.lock().await;
        SessionStats {
            connections: st.registry.len(),
            rooms: st.rooms.room_count(),
        }
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &SharedSession {
        &self.session
    }
}

fn validate_display_name(raw: &str) -> Result<String, SessionError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(SessionError::invalid("display name must not be empty"));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(SessionError::invalid(format!(
            "display name longer than {} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Same-room join: refresh the name, resend the snapshot, and re-announce to
/// the others only if the name actually changed.
fn rejoin(
    st: &mut SessionState,
    conn_id: &ConnId,
    room_id: RoomId,
    display_name: &str,
    previous_name: Option<String>,
) -> Result<Admission, SessionError> {
    st.registry.set_identity(conn_id, display_name)?;

    let others = st.rooms.other_members_of(&room_id, conn_id);
    let members = st.member_infos(&others);
    st.registry.send(
        conn_id,
        ServerMessage::RoomJoined {
            room_id: room_id.clone(),
            members: members.clone(),
        },
    );

    if previous_name.as_deref() != Some(display_name) {
        debug!("{} renamed to {} in room {}", conn_id, display_name, room_id);
        st.deliver(
            &others,
            ServerMessage::MemberJoined {
                room_id: room_id.clone(),
                member: MemberInfo {
                    connection_id: conn_id.clone(),
                    display_name: display_name.to_string(),
                },
            },
        );
    }

    Ok(Admission {
        room_id,
        members,
        created: false,
    })
}

/// Remove `conn_id` from its room and tell whoever is left.
fn depart(st: &mut SessionState, conn_id: &ConnId) -> Option<Departure> {
    let identity = st.registry.lookup(conn_id).ok()?;
    let room_id = identity.current_room.clone()?;

    // Capture the neighbours before the membership changes.
    let remaining = st.rooms.other_members_of(&room_id, conn_id);
    let room_closed = st.rooms.leave(&room_id, conn_id);
    let _ = st.registry.set_room(conn_id, None);

    let member = identity.member_info();
    st.deliver(
        &remaining,
        ServerMessage::MemberLeft {
            room_id: room_id.clone(),
            member: member.clone(),
        },
    );

    if room_closed {
        info!("Room {} closed after {} left", room_id, conn_id);
    } else {
        info!("{} left room {} ({} remaining)", conn_id, room_id, remaining.len());
    }

    Some(Departure {
        room_id,
        member,
        notified: remaining,
        room_closed,
    })
}
