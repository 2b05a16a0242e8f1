//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization.

use serde::{Deserialize, Serialize};

use crate::directory::{NewRoom, RoomSummary};
use crate::error::{AppError, RoomError};
use crate::store::MessageView;
use crate::types::MessageId;

/// Notice sent to members when the admin closes a room
pub const ROOM_CLOSED_NOTICE: &str = "The room was closed by the admin.";

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new room
    CreateRoom(NewRoom),
    /// List all rooms
    ListRooms,
    /// Check a room secret without joining
    VerifySecret {
        room: String,
        #[serde(default)]
        secret: Option<String>,
    },
    /// Join a room under a username
    JoinRoom {
        room: String,
        username: String,
        #[serde(default)]
        secret: Option<String>,
    },
    /// Leave a room
    LeaveRoom { room: String },
    /// Send a chat message
    SendMessage { room: String, body: String },
    /// Change the room's default message timer (admin only)
    UpdateTimer { room: String, timer: u64 },
    /// Indicate typing started
    Typing { room: String },
    /// Indicate typing stopped
    StopTyping { room: String },
    /// Close the room (admin only)
    CloseRoom { room: String },
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection successful, connection ID issued
    Connected { connection_id: String },
    /// Room created successfully
    RoomCreated { name: String },
    /// Room listing
    RoomList { rooms: Vec<RoomSummary> },
    /// Result of a secret check
    SecretVerified { room: String, success: bool },
    /// Room joined successfully
    Joined { room: String },
    /// Connection detached from a room
    Left { room: String },
    /// Current default timer of a joined room
    RoomTimer { room: String, timer: u64 },
    /// Admin status for the joining connection
    AdminStatus {
        room: String,
        is_admin: bool,
        admin_username: String,
    },
    /// Replay of live messages, timers set to the remaining seconds
    ExistingMessages {
        room: String,
        messages: Vec<MessageView>,
    },
    /// Member usernames after a join or leave
    UserList { room: String, users: Vec<String> },
    /// New chat message
    ReceiveMessage { room: String, message: MessageView },
    /// Message expired and must be removed
    DeleteMessage { room: String, message_id: MessageId },
    /// Default timer changed
    TimerUpdated { room: String, timer: u64 },
    /// Another member started or stopped typing
    UserTyping {
        room: String,
        username: String,
        is_typing: bool,
    },
    /// Room closed by its admin
    RoomClosed { room: String, message: String },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
///
/// Represents different error scenarios that can be communicated to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing room name
    InvalidName,
    /// Non-existent room
    RoomNotFound,
    /// Room name taken
    DuplicateName,
    /// Capacity or timer outside bounds
    InvalidRange,
    /// Admin-only action by a non-admin
    Forbidden,
    /// Room at capacity
    RoomFull,
    /// Secret mismatch
    WrongSecret,
    /// Room closed
    RoomClosed,
    /// Action requires joining the room first
    NotInRoom,
    /// Already joined this room
    AlreadyInRoom,
    /// Invalid message format
    InvalidMessage,
    /// Engine-side failure
    Internal,
}

impl From<&RoomError> for ErrorCode {
    fn from(err: &RoomError) -> Self {
        match err {
            RoomError::InvalidName => ErrorCode::InvalidName,
            RoomError::NotFound(_) => ErrorCode::RoomNotFound,
            RoomError::Duplicate(_) => ErrorCode::DuplicateName,
            RoomError::InvalidCapacity { .. } | RoomError::InvalidTtl { .. } => {
                ErrorCode::InvalidRange
            }
            RoomError::Forbidden { .. } => ErrorCode::Forbidden,
            RoomError::Full => ErrorCode::RoomFull,
            RoomError::WrongSecret => ErrorCode::WrongSecret,
            RoomError::Closed => ErrorCode::RoomClosed,
            RoomError::NotMember(_) => ErrorCode::NotInRoom,
            RoomError::AlreadyMember(_) => ErrorCode::AlreadyInRoom,
            RoomError::UnknownConnection => ErrorCode::Internal,
        }
    }
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::Room(room_err) => (ErrorCode::from(room_err), room_err.to_string()),
            AppError::Json(e) => (
                ErrorCode::InvalidMessage,
                format!("Invalid message format: {}", e),
            ),
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::Internal, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}

impl From<RoomError> for ServerMessage {
    fn from(err: RoomError) -> Self {
        AppError::Room(err).into()
    }
}
