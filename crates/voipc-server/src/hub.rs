//! SignalingHub state — rooms and per-connection bookkeeping.
//!
//! Mirrors the relay's discipline: a `DashMap` entry is the only
//! synchronization primitive. Two connections joining different rooms (or
//! the same room) never block each other outside the brief critical
//! section dashmap itself holds per shard/key — there is no outer mutex
//! serializing the whole hub, matching "single mutator serialization
//! point" from the per-key entry's perspective.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use voipc_protocol::messages::ServerMessage;
use voipc_protocol::types::{AccountId, RoomId, UserSummary, VoiceChannelSnapshot, WsClientId};

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// The reserved room every authenticated socket belongs to regardless of
/// which channel it is currently viewing.
pub const GLOBAL_ROOM: &str = "global";

/// A room is all-digits (a text-channel id) or `global` iff it must be
/// excluded from voice-channel-update fan-out.
fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn is_voice_room(room_id: &str) -> bool {
    room_id != GLOBAL_ROOM && !is_all_digits(room_id)
}

/// One accepted, authenticated WebSocket connection.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    user_id: AccountId,
    username: String,
    room: Option<RoomId>,
}

/// A named fan-out group: client id -> display name.
#[derive(Default, Clone)]
struct Room {
    members: HashMap<WsClientId, String>,
}

/// Owns every `Room` and per-socket connection record on the signaling
/// plane. No other component mutates this state.
#[derive(Default)]
pub struct SignalingHub {
    connections: DashMap<WsClientId, Connection>,
    rooms: DashMap<RoomId, Room>,
    /// account id -> every WS client id currently authenticated as that account.
    user_index: DashMap<AccountId, Vec<WsClientId>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly authenticated socket and place it in `global`.
    pub fn register(
        &self,
        client_id: WsClientId,
        user_id: AccountId,
        username: String,
        outbound: mpsc::UnboundedSender<Message>,
    ) {
        self.user_index
            .entry(user_id.clone())
            .or_default()
            .push(client_id.clone());
        self.rooms
            .entry(GLOBAL_ROOM.to_string())
            .or_default()
            .members
            .insert(client_id.clone(), username.clone());
        self.connections.insert(
            client_id,
            Connection {
                outbound,
                user_id,
                username,
                room: None,
            },
        );
    }

    /// Move `client_id` into `room_id`, leaving any prior (non-`global`)
    /// room. Returns `(left, entered)`: the previous room if membership
    /// changed there, and whether the new room participates in voice
    /// presence fan-out. A join to the current room is a no-op.
    pub fn join_room(&self, client_id: &WsClientId, room_id: &str) -> JoinOutcome {
        let Some(mut conn) = self.connections.get_mut(client_id) else {
            return JoinOutcome::default();
        };
        if conn.room.as_deref() == Some(room_id) {
            return JoinOutcome::default();
        }

        let username = conn.username.clone();
        let left = conn.room.take();
        conn.room = Some(room_id.to_string());
        drop(conn);

        let mut left_voice = false;
        if let Some(old) = &left {
            self.remove_from_room(old, client_id);
            left_voice = is_voice_room(old);
        }

        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .members
            .insert(client_id.clone(), username);

        JoinOutcome {
            left,
            left_was_voice: left_voice,
            entered_voice: is_voice_room(room_id),
        }
    }

    /// Leave the current room (not `global`), if any. Returns the room left.
    pub fn leave_room(&self, client_id: &WsClientId) -> Option<RoomId> {
        let mut conn = self.connections.get_mut(client_id)?;
        let room = conn.room.take()?;
        drop(conn);
        self.remove_from_room(&room, client_id);
        Some(room)
    }

    fn remove_from_room(&self, room_id: &str, client_id: &WsClientId) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.members.remove(client_id);
            let empty = room.members.is_empty();
            drop(room);
            if empty && room_id != GLOBAL_ROOM {
                self.rooms.remove(room_id);
                debug!(room = room_id, "room emptied, removed");
            }
        }
    }

    /// Fully remove a connection on disconnect: its current room, `global`,
    /// the user index, and the connection record itself. Returns the room
    /// it was in (for voice-presence fan-out), if any.
    pub fn disconnect(&self, client_id: &WsClientId) -> Option<RoomId> {
        let Some((_, conn)) = self.connections.remove(client_id) else {
            return None;
        };
        self.remove_from_room(GLOBAL_ROOM, client_id);
        if let Some(room) = &conn.room {
            self.remove_from_room(room, client_id);
        }
        if let Some(mut ids) = self.user_index.get_mut(&conn.user_id) {
            ids.retain(|id| id != client_id);
        }
        conn.room
    }

    pub fn room_of(&self, client_id: &WsClientId) -> Option<RoomId> {
        self.connections.get(client_id).and_then(|c| c.room.clone())
    }

    pub fn username_of(&self, client_id: &WsClientId) -> Option<String> {
        self.connections.get(client_id).map(|c| c.username.clone())
    }

    /// Every room, with its member snapshot (includes `global`).
    pub fn get_all_rooms(&self) -> Vec<(RoomId, Vec<UserSummary>)> {
        self.rooms
            .iter()
            .map(|entry| {
                let users = entry
                    .members
                    .iter()
                    .map(|(client_id, username)| UserSummary {
                        client_id: client_id.clone(),
                        username: username.clone(),
                    })
                    .collect();
                (entry.key().clone(), users)
            })
            .collect()
    }

    /// Snapshot of every voice-presence room (excludes `global` and numeric
    /// text-channel rooms), for the `voice-channel-update` broadcast.
    pub fn voice_channel_snapshot(&self) -> Vec<VoiceChannelSnapshot> {
        self.rooms
            .iter()
            .filter(|entry| is_voice_room(entry.key()))
            .map(|entry| VoiceChannelSnapshot {
                channel_id: entry.key().clone(),
                users: entry
                    .members
                    .iter()
                    .map(|(client_id, username)| UserSummary {
                        client_id: client_id.clone(),
                        username: username.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn send_to(&self, client_id: &WsClientId, msg: &ServerMessage) {
        if let Some(conn) = self.connections.get(client_id) {
            if let Ok(json) = serde_json::to_string(msg) {
                let _ = conn.outbound.send(Message::Text(json.into()));
            }
        }
    }

    pub fn broadcast_to_room(&self, room_id: &str, msg: &ServerMessage) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let targets: Vec<WsClientId> = room.members.keys().cloned().collect();
        drop(room);
        for target in targets {
            self.send_to(&target, msg);
        }
    }

    /// Broadcast to a room, skipping one sender's own socket.
    pub fn broadcast_to_room_except(&self, room_id: &str, except: &WsClientId, msg: &ServerMessage) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let targets: Vec<WsClientId> = room
            .members
            .keys()
            .filter(|id| *id != except)
            .cloned()
            .collect();
        drop(room);
        for target in targets {
            self.send_to(&target, msg);
        }
    }

    pub fn broadcast_to_all(&self, msg: &ServerMessage) {
        let targets: Vec<WsClientId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            self.send_to(&target, msg);
        }
    }

    pub fn broadcast_to_user(&self, user_id: &str, msg: &ServerMessage) {
        let Some(ids) = self.user_index.get(user_id) else {
            return;
        };
        let targets = ids.clone();
        drop(ids);
        for target in targets {
            self.send_to(&target, msg);
        }
    }

    pub fn unicast(&self, client_id: &WsClientId, msg: &ServerMessage) {
        self.send_to(client_id, msg);
    }

    pub fn is_connected(&self, client_id: &WsClientId) -> bool {
        self.connections.contains_key(client_id)
    }
}

#[derive(Default)]
pub struct JoinOutcome {
    pub left: Option<RoomId>,
    pub left_was_voice: bool,
    pub entered_voice: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(hub: &SignalingHub, client: &str, user: &str) {
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.register(client.to_string(), user.to_string(), format!("{client}-name"), tx);
    }

    #[test]
    fn register_places_client_in_global() {
        let hub = SignalingHub::new();
        conn(&hub, "c1", "u1");
        let rooms = hub.get_all_rooms();
        let global = rooms.iter().find(|(id, _)| id == GLOBAL_ROOM).unwrap();
        assert_eq!(global.1.len(), 1);
    }

    #[test]
    fn join_room_moves_between_rooms_and_excludes_global_numeric() {
        let hub = SignalingHub::new();
        conn(&hub, "c1", "u1");
        let outcome = hub.join_room(&"c1".to_string(), "lounge");
        assert!(outcome.entered_voice);
        assert!(outcome.left.is_none());

        let outcome2 = hub.join_room(&"c1".to_string(), "42");
        assert!(!outcome2.entered_voice);
        assert_eq!(outcome2.left.as_deref(), Some("lounge"));
        assert!(outcome2.left_was_voice);
    }

    #[test]
    fn join_same_room_is_noop() {
        let hub = SignalingHub::new();
        conn(&hub, "c1", "u1");
        hub.join_room(&"c1".to_string(), "lounge");
        let outcome = hub.join_room(&"c1".to_string(), "lounge");
        assert!(outcome.left.is_none());
    }

    #[test]
    fn empty_room_is_removed_but_global_persists() {
        let hub = SignalingHub::new();
        conn(&hub, "c1", "u1");
        hub.join_room(&"c1".to_string(), "lounge");
        hub.leave_room(&"c1".to_string());
        let rooms: Vec<_> = hub.get_all_rooms().into_iter().map(|(id, _)| id).collect();
        assert!(!rooms.contains(&"lounge".to_string()));
        assert!(rooms.contains(&GLOBAL_ROOM.to_string()));
    }

    #[test]
    fn disconnect_removes_from_every_room_and_user_index() {
        let hub = SignalingHub::new();
        conn(&hub, "c1", "u1");
        hub.join_room(&"c1".to_string(), "lounge");
        let left = hub.disconnect(&"c1".to_string());
        assert_eq!(left.as_deref(), Some("lounge"));
        assert!(!hub.is_connected(&"c1".to_string()));
        assert!(hub.get_all_rooms().iter().all(|(id, _)| id != "lounge"));
    }

    #[test]
    fn voice_channel_snapshot_excludes_global_and_numeric_rooms() {
        let hub = SignalingHub::new();
        conn(&hub, "c1", "u1");
        conn(&hub, "c2", "u2");
        hub.join_room(&"c1".to_string(), "lounge");
        hub.join_room(&"c2".to_string(), "42");
        let snapshot = hub.voice_channel_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].channel_id, "lounge");
    }

    #[test]
    fn multiple_sockets_for_same_account_all_receive_broadcast_to_user() {
        let hub = SignalingHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.register("c1".into(), "u1".into(), "alice-tab1".into(), tx1);
        hub.register("c2".into(), "u1".into(), "alice-tab2".into(), tx2);
        hub.broadcast_to_user("u1", &ServerMessage::Pong);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
