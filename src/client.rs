//! Client struct definition
//!
//! Represents a registered connection: its outbound channel and the rooms
//! it has joined.

use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::ConnectionId;

/// Connected client information
///
/// The sender is the delivery end of every broadcast that targets this
/// connection. Per-room usernames live in the room roster.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Engine → Client message channel
    pub sender: mpsc::Sender<ServerMessage>,
    /// Names of rooms this connection has joined
    rooms: BTreeSet<String>,
}

impl Client {
    /// Create a new client with the given ID and sender channel
    pub fn new(id: ConnectionId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            sender,
            rooms: BTreeSet::new(),
        }
    }

    /// Queue a message for this client without waiting
    ///
    /// Fails with `SendError::Full` when the client has stopped reading,
    /// and `SendError::ChannelClosed` once it disconnected.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Record that this client joined `room`
    pub fn join_room(&mut self, room: &str) {
        self.rooms.insert(room.to_string());
    }

    /// Forget `room`; returns false if it was not recorded
    pub fn leave_room(&mut self, room: &str) -> bool {
        self.rooms.remove(room)
    }

    /// Take all recorded rooms (used on disconnect)
    pub fn take_rooms(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rooms).into_iter().collect()
    }
}
