//! Room registry: membership, presence, and typing state.
//!
//! All of this is ephemeral, process-local state. Rooms are created lazily
//! on first join and removed once their last session leaves; the durable
//! stores are never consulted here. A user with several live sessions in
//! the same room stays online until the last one disconnects, so presence
//! tracks a per-user session count rather than a flag.
//!
//! The registry is one instance per process, created at server start and
//! injected into the engine. Only the engine mutates it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ProjectId, SessionId, UserId};

/// Ephemeral state for one room.
#[derive(Debug)]
pub struct Room {
    project_id: ProjectId,
    /// Joined sessions and the user each one authenticated as.
    sessions: Mutex<HashMap<SessionId, UserId>>,
    /// Live session count per online user.
    online: Mutex<HashMap<UserId, usize>>,
    /// Display names of users currently typing. A set, so several users
    /// can show as typing at once.
    typing: Mutex<BTreeSet<String>>,
}

impl Room {
    fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            sessions: Mutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
            typing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Add a session for a user. Returns true when the user was not online
    /// before (first session).
    pub fn add_session(&self, session_id: &str, user_id: &str) -> bool {
        self.sessions
            .lock()
            .insert(session_id.to_string(), user_id.to_string());

        let mut online = self.online.lock();
        let count = online.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Remove a session. Returns the user it belonged to and whether that
    /// user went offline with it (last session gone).
    pub fn remove_session(&self, session_id: &str) -> Option<(UserId, bool)> {
        let user_id = self.sessions.lock().remove(session_id)?;

        let mut online = self.online.lock();
        let went_offline = match online.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                online.remove(&user_id);
                true
            }
            None => false,
        };

        Some((user_id, went_offline))
    }

    /// All joined session ids.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Online user ids, sorted for stable broadcasts.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.lock().keys().cloned().collect();
        users.sort();
        users
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Mark a user as typing. Returns true when newly added.
    pub fn typing_started(&self, user_name: &str) -> bool {
        self.typing.lock().insert(user_name.to_string())
    }

    /// Clear a user's typing state. Returns true when it was set.
    pub fn typing_stopped(&self, user_name: &str) -> bool {
        self.typing.lock().remove(user_name)
    }

    /// Users currently typing.
    pub fn typing_users(&self) -> Vec<String> {
        self.typing.lock().iter().cloned().collect()
    }
}

/// Process-wide registry of live rooms.
pub struct RoomRegistry {
    rooms: DashMap<ProjectId, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Get a room, creating it lazily on first join.
    pub fn get_or_create(&self, project_id: &str) -> Arc<Room> {
        self.rooms
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(project_id)))
            .clone()
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(project_id).map(|r| r.clone())
    }

    /// Drop the room if it no longer has any sessions.
    pub fn remove_if_empty(&self, project_id: &str) {
        self.rooms
            .remove_if(project_id, |_, room| room.is_empty());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total joined sessions across all rooms.
    pub fn session_count(&self) -> usize {
        self.rooms.iter().map(|r| r.session_count()).sum()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick a display color for a new session.
pub fn pick_session_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_then_leave_restores_presence() {
        let registry = RoomRegistry::new();
        let room = registry.get_or_create("proj-1");

        let before = room.online_users();
        assert!(room.add_session("s1", "u1"));
        assert_eq!(room.online_users(), vec!["u1"]);

        let (user, went_offline) = room.remove_session("s1").unwrap();
        assert_eq!(user, "u1");
        assert!(went_offline);
        assert_eq!(room.online_users(), before);
    }

    #[test]
    fn test_user_with_two_sessions_stays_online() {
        let registry = RoomRegistry::new();
        let room = registry.get_or_create("proj-1");

        assert!(room.add_session("s1", "u1"));
        // Second tab: user already online.
        assert!(!room.add_session("s2", "u1"));

        let (_, went_offline) = room.remove_session("s1").unwrap();
        assert!(!went_offline);
        assert_eq!(room.online_users(), vec!["u1"]);

        let (_, went_offline) = room.remove_session("s2").unwrap();
        assert!(went_offline);
        assert!(room.online_users().is_empty());
    }

    #[test]
    fn test_remove_unknown_session_is_none() {
        let registry = RoomRegistry::new();
        let room = registry.get_or_create("proj-1");
        assert!(room.remove_session("ghost").is_none());
    }

    #[test]
    fn test_typing_tracks_a_set() {
        let registry = RoomRegistry::new();
        let room = registry.get_or_create("proj-1");

        assert!(room.typing_started("Alice"));
        assert!(room.typing_started("Bob"));
        assert!(!room.typing_started("Alice"));
        assert_eq!(room.typing_users(), vec!["Alice", "Bob"]);

        assert!(room.typing_stopped("Alice"));
        assert!(!room.typing_stopped("Alice"));
        assert_eq!(room.typing_users(), vec!["Bob"]);
    }

    #[test]
    fn test_room_created_lazily_and_garbage_collected() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.room_count(), 0);

        let room = registry.get_or_create("proj-1");
        room.add_session("s1", "u1");
        assert_eq!(registry.room_count(), 1);

        // Still occupied: removal refuses.
        registry.remove_if_empty("proj-1");
        assert_eq!(registry.room_count(), 1);

        room.remove_session("s1");
        registry.remove_if_empty("proj-1");
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_session_counts() {
        let registry = RoomRegistry::new();
        let a = registry.get_or_create("proj-a");
        let b = registry.get_or_create("proj-b");

        a.add_session("s1", "u1");
        a.add_session("s2", "u2");
        b.add_session("s3", "u3");

        assert_eq!(registry.session_count(), 3);
        assert_eq!(a.session_count(), 2);
    }

    #[test]
    fn test_pick_session_color_is_hex() {
        let color = pick_session_color();
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }
}
