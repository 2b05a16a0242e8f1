//! Ephemeral Chat Room Server Library
//!
//! Anonymous users create and join named, optionally password-protected
//! rooms in which every message self-destructs after the room's timer.
//!
//! # Features
//! - Room directory: create, list, verify password
//! - Membership with capacity limits and first-joiner admin
//! - Messages with per-message expiry and replay for late joiners
//! - Admin-only timer changes and room closing
//! - Typing indicators with inactivity timeout
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `RoomEngine` is the central actor owning all room state
//! - `EngineHandle` is the cloneable request/reply front door
//! - Timers post commands back into the actor's channel, so expiries are
//!   serialized with every other mutation
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use hush_server::{handle_connection, EngineConfig, RoomEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
//!     let engine = RoomEngine::spawn(EngineConfig::default());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, engine.clone()));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod handle;
pub mod handler;
pub mod message;
pub mod room;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod typing;

// Re-export main types for convenience
pub use client::Client;
pub use config::EngineConfig;
pub use directory::{NewRoom, RoomDirectory, RoomSummary};
pub use error::{AppError, RoomError, SendError};
pub use handle::EngineHandle;
pub use handler::handle_connection;
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use room::{Member, Room};
pub use server::{EngineCommand, JoinOutcome, RoomEngine};
pub use store::{MessageLog, MessageView};
pub use types::{ConnectionId, MessageId};
