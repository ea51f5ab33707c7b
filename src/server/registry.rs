//! Room membership tracking.
//!
//! Rooms are transient in-memory sets: created on first join, dropped when
//! the last member leaves. The registry trusts the supplied `room_id`; the
//! question of who may join which room belongs to the [`RoomAuthorizer`]
//! collaborator.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

/// Decides whether a connection may join a room. Consulted by the coordinator
/// before membership changes; policy is entirely up to the implementation.
#[async_trait]
pub trait RoomAuthorizer: Send + Sync {
    async fn allow_join(&self, connection_id: &str, room_id: &str) -> bool;
}

/// Default authorizer: every join is permitted.
pub struct AllowAll;

#[async_trait]
impl RoomAuthorizer for AllowAll {
    async fn allow_join(&self, _connection_id: &str, _room_id: &str) -> bool {
        true
    }
}

/// `room_id -> members` plus the reverse map used for the disconnect sweep.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, HashSet<String>>,
    memberships: HashMap<String, HashSet<String>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the connection to the room, creating it if needed. Idempotent.
    /// Returns the other current members, for the join notification fan-out.
    pub fn join(&mut self, connection_id: &str, room_id: &str) -> Vec<String> {
        let members = self.rooms.entry(room_id.to_owned()).or_default();
        let others: Vec<String> = members
            .iter()
            .filter(|id| id.as_str() != connection_id)
            .cloned()
            .collect();
        members.insert(connection_id.to_owned());
        self.memberships
            .entry(connection_id.to_owned())
            .or_default()
            .insert(room_id.to_owned());
        others
    }

    /// Removes the connection from the room. Returns the remaining members
    /// if it actually was one, `None` for the idempotent no-op case.
    pub fn leave(&mut self, connection_id: &str, room_id: &str) -> Option<Vec<String>> {
        let members = self.rooms.get_mut(room_id)?;
        if !members.remove(connection_id) {
            return None;
        }
        let remaining: Vec<String> = members.iter().cloned().collect();
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        if let Some(rooms) = self.memberships.get_mut(connection_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.memberships.remove(connection_id);
            }
        }
        Some(remaining)
    }

    /// Removes the connection from every room it is a member of. Returns the
    /// remaining members per room, one entry per `participant:left` fan-out.
    pub fn disconnect(&mut self, connection_id: &str) -> Vec<(String, Vec<String>)> {
        let rooms: Vec<String> = self
            .memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms
            .into_iter()
            .filter_map(|room_id| {
                self.leave(connection_id, &room_id)
                    .map(|remaining| (room_id, remaining))
            })
            .collect()
    }

    /// Current members of a room, empty if the room does not exist.
    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: &str, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_equals_joins_minus_leaves() {
        let mut registry = RoomRegistry::new();
        assert!(registry.join("a", "r1").is_empty());
        assert_eq!(registry.join("b", "r1"), vec!["a".to_string()]);
        let mut others = registry.join("c", "r1");
        others.sort();
        assert_eq!(others, vec!["a".to_string(), "b".to_string()]);

        assert!(registry.leave("b", "r1").is_some());
        let mut members = registry.members("r1");
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn join_is_idempotent() {
        let mut registry = RoomRegistry::new();
        registry.join("a", "r1");
        registry.join("a", "r1");
        assert_eq!(registry.members("r1"), vec!["a".to_string()]);
    }

    #[test]
    fn leave_unknown_room_is_noop() {
        let mut registry = RoomRegistry::new();
        assert!(registry.leave("a", "nowhere").is_none());
        registry.join("a", "r1");
        assert!(registry.leave("b", "r1").is_none());
        assert!(registry.is_member("a", "r1"));
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let mut registry = RoomRegistry::new();
        registry.join("a", "r1");
        registry.join("a", "r2");
        assert_eq!(registry.room_count(), 2);
        assert!(registry.leave("a", "r1").is_some());
        assert_eq!(registry.room_count(), 1);
        registry.disconnect("a");
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn disconnect_sweeps_every_room() {
        let mut registry = RoomRegistry::new();
        registry.join("a", "r1");
        registry.join("a", "r2");
        registry.join("a", "r3");
        registry.join("b", "r1");
        registry.join("c", "r2");

        let mut swept = registry.disconnect("a");
        swept.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(swept.len(), 3);
        assert_eq!(swept[0], ("r1".to_string(), vec!["b".to_string()]));
        assert_eq!(swept[1], ("r2".to_string(), vec!["c".to_string()]));
        assert_eq!(swept[2], ("r3".to_string(), vec![]));
        assert!(!registry.is_member("a", "r1"));
        assert!(!registry.is_member("a", "r2"));

        // Second disconnect has nothing left to sweep.
        assert!(registry.disconnect("a").is_empty());
    }
}
