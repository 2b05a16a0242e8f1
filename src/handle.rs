//! Handle to a running RoomEngine
//!
//! Cloneable front door used by transports: each call posts one command
//! and awaits the engine's reply.

use tokio::sync::{mpsc, oneshot};

use crate::directory::{NewRoom, RoomSummary};
use crate::error::AppError;
use crate::message::ServerMessage;
use crate::server::{EngineCommand, JoinOutcome, Reply};
use crate::store::MessageView;
use crate::types::ConnectionId;

/// Request/reply access to the engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::Sender<EngineCommand>) -> Self {
        Self { commands }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| AppError::ChannelSend)?;
        let result = reply_rx.await.map_err(|_| AppError::ChannelSend)?;
        Ok(result?)
    }

    /// Register a connection and the channel its events go to
    pub async fn connect(
        &self,
        connection: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), AppError> {
        self.commands
            .send(EngineCommand::Connect { connection, sender })
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    /// Unregister a connection, leaving all its rooms
    pub async fn disconnect(&self, connection: ConnectionId) {
        let _ = self
            .commands
            .send(EngineCommand::Disconnect { connection })
            .await;
    }

    /// Create a room, returning its name
    pub async fn create_room(&self, request: NewRoom) -> Result<String, AppError> {
        self.request(|reply| EngineCommand::CreateRoom { request, reply })
            .await
    }

    /// Snapshot of all rooms
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, AppError> {
        self.request(|reply| EngineCommand::ListRooms { reply }).await
    }

    /// Check a room secret without joining
    pub async fn verify_secret(
        &self,
        room: &str,
        secret: Option<String>,
    ) -> Result<bool, AppError> {
        self.request(|reply| EngineCommand::VerifySecret {
            room: room.to_string(),
            secret,
            reply,
        })
        .await
    }

    /// Change a room's default TTL without an admin check
    ///
    /// Only for callers that authenticate the change themselves.
    pub async fn set_room_ttl(&self, room: &str, ttl: u64) -> Result<u64, AppError> {
        self.request(|reply| EngineCommand::SetRoomTtl {
            room: room.to_string(),
            ttl,
            reply,
        })
        .await
    }

    /// Join a room under `username`
    pub async fn join(
        &self,
        connection: ConnectionId,
        room: &str,
        username: &str,
        secret: Option<String>,
    ) -> Result<JoinOutcome, AppError> {
        self.request(|reply| EngineCommand::Join {
            connection,
            room: room.to_string(),
            username: username.to_string(),
            secret,
            reply,
        })
        .await
    }

    /// Leave a room
    pub async fn leave(&self, connection: ConnectionId, room: &str) -> Result<(), AppError> {
        self.request(|reply| EngineCommand::Leave {
            connection,
            room: room.to_string(),
            reply,
        })
        .await
    }

    /// Send a message to a joined room
    pub async fn send_message(
        &self,
        connection: ConnectionId,
        room: &str,
        body: &str,
    ) -> Result<MessageView, AppError> {
        self.request(|reply| EngineCommand::SendMessage {
            connection,
            room: room.to_string(),
            body: body.to_string(),
            reply,
        })
        .await
    }

    /// Change the room's default TTL (admin only)
    pub async fn update_ttl(
        &self,
        connection: ConnectionId,
        room: &str,
        ttl: u64,
    ) -> Result<u64, AppError> {
        self.request(|reply| EngineCommand::UpdateTtl {
            connection,
            room: room.to_string(),
            ttl,
            reply,
        })
        .await
    }

    /// Close the room (admin only)
    pub async fn close_room(&self, connection: ConnectionId, room: &str) -> Result<(), AppError> {
        self.request(|reply| EngineCommand::CloseRoom {
            connection,
            room: room.to_string(),
            reply,
        })
        .await
    }

    /// Raise or clear this connection's typing flag
    pub async fn set_typing(
        &self,
        connection: ConnectionId,
        room: &str,
        is_typing: bool,
    ) -> Result<(), AppError> {
        self.request(|reply| EngineCommand::Typing {
            connection,
            room: room.to_string(),
            is_typing,
            reply,
        })
        .await
    }
}
