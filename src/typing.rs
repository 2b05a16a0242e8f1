//! Typing indicators
//!
//! Non-persisted per-room typing flags, keyed by case-folded username.
//! Each flag owns its inactivity timer; a refresh replaces the timer and
//! bumps the generation so an already-queued expiry of the old timer is
//! recognised as stale.

use std::collections::HashMap;

use crate::scheduler::TimerHandle;
use crate::types::ConnectionId;

/// A user currently flagged as typing
#[derive(Debug)]
pub struct Typist {
    /// Username as last signalled
    pub username: String,
    /// Connection that raised the flag (excluded from broadcasts)
    pub connection: ConnectionId,
    generation: u64,
    _expiry: TimerHandle,
}

/// Typing flags for one room
#[derive(Debug, Default)]
pub struct TypingState {
    typists: HashMap<String, Typist>,
    next_generation: u64,
}

impl TypingState {
    /// Create an empty typing state
    pub fn new() -> Self {
        Self::default()
    }

    /// Map key for a username
    pub fn key(username: &str) -> String {
        username.to_lowercase()
    }

    /// Raise or refresh the typing flag for `username`
    ///
    /// `arm` receives the map key and generation and must return the
    /// expiry timer. Any previous timer for the same user is dropped
    /// (cancelled). Returns true if the user was not typing before.
    pub fn start<F>(&mut self, username: &str, connection: ConnectionId, arm: F) -> bool
    where
        F: FnOnce(String, u64) -> TimerHandle,
    {
        let key = Self::key(username);
        let generation = self.next_generation;
        self.next_generation += 1;

        let typist = Typist {
            username: username.to_string(),
            connection,
            generation,
            _expiry: arm(key.clone(), generation),
        };
        self.typists.insert(key, typist).is_none()
    }

    /// Clear the flag for `username`, returning it if it was set
    pub fn stop(&mut self, username: &str) -> Option<Typist> {
        self.typists.remove(&Self::key(username))
    }

    /// Clear the flag for `key` if `generation` is still current
    pub fn expire(&mut self, key: &str, generation: u64) -> Option<Typist> {
        match self.typists.get(key) {
            Some(typist) if typist.generation == generation => self.typists.remove(key),
            _ => None,
        }
    }

    /// Clear every flag raised by `connection`
    pub fn clear_connection(&mut self, connection: ConnectionId) -> Vec<Typist> {
        let keys: Vec<String> = self
            .typists
            .iter()
            .filter(|(_, t)| t.connection == connection)
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter()
            .filter_map(|k| self.typists.remove(k))
            .collect()
    }

    /// Drop all flags and their timers
    pub fn clear(&mut self) {
        self.typists.clear();
    }

    #[cfg(test)]
    fn is_typing(&self, username: &str) -> bool {
        self.typists.contains_key(&Self::key(username))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.typists.len()
    }
}
