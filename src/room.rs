//! Room struct definition
//!
//! Represents a named chat room: its secret, capacity, member roster,
//! admin, default message timer, message log and typing flags.
//! All checks here are synchronous; the engine provides serialization.

use crate::config::EngineConfig;
use crate::error::RoomError;
use crate::scheduler::TimerHandle;
use crate::store::MessageLog;
use crate::typing::TypingState;
use crate::types::ConnectionId;

/// A connection registered in a room under a username
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub connection: ConnectionId,
    pub username: String,
}

/// Named chat room
///
/// The admin is the username of the first successful joiner and never
/// changes afterwards. Once closed, a room only waits for its purge.
#[derive(Debug)]
pub struct Room {
    /// Unique room name
    pub name: String,
    /// Shared secret (empty means public)
    secret: String,
    /// User limit (None means unlimited)
    capacity: Option<u32>,
    /// TTL in seconds for messages sent from now on
    default_ttl: u64,
    /// Username of the first successful joiner
    admin: Option<String>,
    /// Terminal flag
    closed: bool,
    /// Roster in join order, unique by connection
    members: Vec<Member>,
    /// Live messages
    pub messages: MessageLog,
    /// Typing flags
    pub typing: TypingState,
    /// Pending purge after close
    purge_timer: Option<TimerHandle>,
}

impl Room {
    /// Create a new open room with no members
    pub fn new(
        name: String,
        secret: Option<String>,
        capacity: Option<u32>,
        default_ttl: u64,
    ) -> Self {
        Self {
            name,
            secret: secret.unwrap_or_default(),
            capacity,
            default_ttl,
            admin: None,
            closed: false,
            members: Vec::new(),
            messages: MessageLog::new(),
            typing: TypingState::new(),
            purge_timer: None,
        }
    }

    /// Check if the room requires a secret
    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }

    /// Check a secret attempt (always true for public rooms)
    pub fn verify_secret(&self, candidate: Option<&str>) -> bool {
        !self.has_secret() || candidate == Some(self.secret.as_str())
    }

    /// User limit, if any
    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    /// TTL applied to newly sent messages
    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Admin username, once someone has joined
    pub fn admin(&self) -> Option<&str> {
        self.admin.as_deref()
    }

    /// Check if `username` is the admin
    pub fn is_admin(&self, username: &str) -> bool {
        self.admin.as_deref() == Some(username)
    }

    /// Check if the room has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reject any operation on a closed room
    pub fn ensure_open(&self) -> Result<(), RoomError> {
        if self.closed {
            Err(RoomError::Closed)
        } else {
            Ok(())
        }
    }

    /// Check if room is full
    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|limit| self.members.len() >= limit as usize)
    }

    /// Number of members
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Find the member registered for a connection
    pub fn member(&self, connection: ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| m.connection == connection)
    }

    /// Check if a connection is in this room
    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.member(connection).is_some()
    }

    /// Connection ids of all members (broadcast targets)
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.members.iter().map(|m| m.connection).collect()
    }

    /// Usernames in join order, duplicates kept
    pub fn usernames(&self) -> Vec<String> {
        self.members.iter().map(|m| m.username.clone()).collect()
    }

    /// Register a connection under `username`
    ///
    /// Checks closed, secret and capacity in that order. The first
    /// successful joiner becomes admin.
    pub fn admit(
        &mut self,
        connection: ConnectionId,
        username: &str,
        secret_attempt: Option<&str>,
    ) -> Result<(), RoomError> {
        self.ensure_open()?;
        if !self.verify_secret(secret_attempt) {
            return Err(RoomError::WrongSecret);
        }
        if self.is_full() {
            return Err(RoomError::Full);
        }
        if self.contains(connection) {
            return Err(RoomError::AlreadyMember(self.name.clone()));
        }

        self.members.push(Member {
            connection,
            username: username.to_string(),
        });
        if self.admin.is_none() {
            self.admin = Some(username.to_string());
        }
        Ok(())
    }

    /// Remove a connection from the roster
    ///
    /// Never clears the admin; an emptied room stays until closed.
    pub fn remove_member(&mut self, connection: ConnectionId) -> Option<Member> {
        let index = self.members.iter().position(|m| m.connection == connection)?;
        Some(self.members.remove(index))
    }

    /// Ensure `connection` is a member holding the admin username
    pub fn require_admin(
        &self,
        connection: ConnectionId,
        action: &'static str,
    ) -> Result<&Member, RoomError> {
        match self.member(connection) {
            Some(member) if self.is_admin(&member.username) => Ok(member),
            _ => Err(RoomError::Forbidden { action }),
        }
    }

    /// Admin-gated change of the default TTL
    ///
    /// Only messages sent afterwards use the new value.
    pub fn update_default_ttl(
        &mut self,
        connection: ConnectionId,
        ttl: u64,
        config: &EngineConfig,
    ) -> Result<u64, RoomError> {
        let ttl = config.validate_ttl(ttl)?;
        self.ensure_open()?;
        self.require_admin(connection, "change the timer")?;
        self.default_ttl = ttl;
        Ok(ttl)
    }

    /// Change the default TTL without an identity check
    ///
    /// For trusted callers that authenticate elsewhere.
    pub fn set_default_ttl(&mut self, ttl: u64, config: &EngineConfig) -> Result<u64, RoomError> {
        let ttl = config.validate_ttl(ttl)?;
        self.ensure_open()?;
        self.default_ttl = ttl;
        Ok(ttl)
    }

    /// Admin-gated close; takes effect immediately
    pub fn close(&mut self, connection: ConnectionId) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.require_admin(connection, "close the room")?;
        self.closed = true;
        self.typing.clear();
        Ok(())
    }

    /// Keep the pending purge timer alive with the room
    pub fn set_purge_timer(&mut self, timer: TimerHandle) {
        self.purge_timer = Some(timer);
    }
}
