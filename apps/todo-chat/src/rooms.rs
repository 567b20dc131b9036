//! In-memory room membership.
//!
//! A room exists exactly while it has at least one member. All mutations of a
//! room's member set happen under the map shard lock of that room, so a
//! snapshot never observes a half-applied join or leave.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Result of pushing one frame to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Outbound queue full; this frame was dropped but the member stays.
    Dropped,
    /// The connection's writer is gone. The member must be removed.
    Closed,
}

/// A reference to one live client. The socket itself is owned by the
/// connection task; the handle only holds its outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Message>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn push(&self, frame: Message) -> PushOutcome {
        match self.sender.try_send(frame) {
            Ok(()) => PushOutcome::Delivered,
            Err(TrySendError::Full(_)) => PushOutcome::Dropped,
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub members: usize,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to `room_id`, creating the room if needed. Joining twice
    /// with the same id replaces the earlier handle. Returns the member count.
    pub fn join(&self, room_id: &str, handle: ConnectionHandle) -> usize {
        let mut members = self.rooms.entry(room_id.to_string()).or_default();
        members.insert(handle.id(), handle);
        members.len()
    }

    /// Remove a member, dropping the room once it is empty. Unknown rooms and
    /// members are ignored. Returns the remaining member count.
    pub fn leave(&self, room_id: &str, connection_id: ConnectionId) -> usize {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().remove(&connection_id);
                let remaining = entry.get().len();
                if remaining == 0 {
                    entry.remove();
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        }
    }

    /// Point-in-time copy of a room's members, safe to iterate while other
    /// tasks join or leave.
    pub fn members(&self, room_id: &str) -> Vec<ConnectionHandle> {
        self.rooms
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .iter()
            .map(|entry| RoomSnapshot {
                room_id: entry.key().clone(),
                members: entry.value().len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }
}
