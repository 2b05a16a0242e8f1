//! Room directory
//!
//! Owns the name → room mapping. Creation validates the request and
//! applies the public-room capacity rule; listing returns a snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::RoomError;
use crate::room::Room;

/// Room creation request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRoom {
    pub name: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    /// Initial default TTL in seconds
    #[serde(default, rename = "timer")]
    pub ttl: Option<u64>,
}

impl NewRoom {
    /// Public room with default settings
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Snapshot of one room for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    /// Current member count
    pub users: usize,
    /// User limit, if any
    pub limit: Option<u32>,
    pub has_password: bool,
    /// Default TTL in seconds
    pub timer: u64,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            name: room.name.clone(),
            users: room.member_count(),
            limit: room.capacity(),
            has_password: room.has_secret(),
            timer: room.default_ttl(),
        }
    }
}

/// All live rooms by name
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, Room>,
}

impl RoomDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a new room
    pub fn create_room(
        &mut self,
        request: NewRoom,
        config: &EngineConfig,
    ) -> Result<&mut Room, RoomError> {
        let NewRoom {
            name,
            secret,
            capacity,
            ttl,
        } = request;

        if name.trim().is_empty() {
            return Err(RoomError::InvalidName);
        }
        if self.rooms.contains_key(&name) {
            return Err(RoomError::Duplicate(name));
        }
        let capacity = capacity.map(|c| config.validate_capacity(c)).transpose()?;
        let ttl = ttl
            .map(|t| config.validate_ttl(t))
            .transpose()?
            .unwrap_or(config.default_ttl);

        let secret = secret.filter(|s| !s.is_empty());
        let capacity = match (&secret, capacity) {
            (None, None) => Some(config.public_capacity),
            (_, capacity) => capacity,
        };

        let room = Room::new(name.clone(), secret, capacity, ttl);
        Ok(self.rooms.entry(name).or_insert(room))
    }

    /// Find a room by name
    pub fn lookup(&self, name: &str) -> Result<&Room, RoomError> {
        self.rooms
            .get(name)
            .ok_or_else(|| RoomError::NotFound(name.to_string()))
    }

    /// Find a room by name for mutation
    pub fn lookup_mut(&mut self, name: &str) -> Result<&mut Room, RoomError> {
        self.rooms
            .get_mut(name)
            .ok_or_else(|| RoomError::NotFound(name.to_string()))
    }

    /// Snapshot of all rooms, sorted by name
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.values().map(RoomSummary::from).collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Check a secret attempt against a room
    pub fn verify_secret(&self, name: &str, candidate: Option<&str>) -> Result<bool, RoomError> {
        Ok(self.lookup(name)?.verify_secret(candidate))
    }

    /// Remove a room with its messages (no-op if absent)
    pub fn delete_room(&mut self, name: &str) -> Option<Room> {
        self.rooms.remove(name)
    }

    /// Number of rooms
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Check if there are no rooms
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
