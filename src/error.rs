//! Error types for the room engine
//!
//! Defines user-facing room errors, application-level errors and
//! message send errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Rejections reported synchronously to the caller of an engine operation
///
/// All of these are expected, recoverable conditions. Each carries a short
/// human-readable reason; presentation is up to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// Room name missing or blank
    #[error("Room name is required")]
    InvalidName,

    /// No room with the given name
    #[error("Room '{0}' does not exist")]
    NotFound(String),

    /// A room with this name already exists
    #[error("Room '{0}' already exists")]
    Duplicate(String),

    /// User limit outside the allowed range
    #[error("User limit must be between {min} and {max}")]
    InvalidCapacity { min: u32, max: u32 },

    /// Message timer outside the allowed range
    #[error("Timer must be between {min} and {max} seconds")]
    InvalidTtl { min: u64, max: u64 },

    /// Admin-only action attempted by someone else
    #[error("Only the room creator can {action}")]
    Forbidden { action: &'static str },

    /// Room capacity reached
    #[error("Room is full")]
    Full,

    /// Room secret did not match
    #[error("Incorrect password")]
    WrongSecret,

    /// Room has been closed by its admin
    #[error("Room is closed")]
    Closed,

    /// Connection is not a member of the room
    #[error("You are not in room '{0}'")]
    NotMember(String),

    /// Connection already joined the room
    #[error("You are already in room '{0}'")]
    AlreadyMember(String),

    /// Command arrived for a connection the engine does not know
    #[error("Unknown connection")]
    UnknownConnection,
}

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// room rejections (sent back to the client as an error frame).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error (fatal - engine stopped)
    #[error("Channel send error")]
    ChannelSend,

    /// Operation rejected by the room engine
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// Message send errors
///
/// Occurs when a connection's outbound queue is closed or full.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The connection is not draining its queue
    #[error("Channel full")]
    Full,
}
