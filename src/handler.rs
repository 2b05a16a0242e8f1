//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake,
//! message parsing, and bidirectional communication with the RoomEngine.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::handle::EngineHandle;
use crate::message::{ClientMessage, ServerMessage};
use crate::types::ConnectionId;

/// Outbound buffer per connection
const CLIENT_BUFFER_SIZE: usize = 64;

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle.
pub async fn handle_connection(stream: TcpStream, engine: EngineHandle) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection = ConnectionId::new();
    info!("Connection {} opened from {}", connection, peer_addr);

    // Channel for engine -> client messages. The engine holds the only
    // strong sender: once it drops this connection the write task drains
    // and ends.
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(CLIENT_BUFFER_SIZE);
    let reply_tx = msg_tx.downgrade();

    if let Err(e) = engine.connect(connection, msg_tx).await {
        error!("Failed to register connection {} - engine closed", connection);
        return Err(e);
    }

    let connected_msg = ServerMessage::Connected {
        connection_id: connection.to_string(),
    };
    let json = serde_json::to_string(&connected_msg)?;
    ws_sender.send(Message::Text(json.into())).await?;

    let engine_read = engine.clone();

    // Spawn read task (WebSocket -> engine)
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => dispatch(&engine_read, connection, client_msg).await,
                        Err(e) => {
                            warn!("Invalid JSON from {}: {}", connection, e);
                            Some(AppError::Json(e).into())
                        }
                    };
                    if let Some(reply) = reply {
                        let Some(reply_tx) = reply_tx.upgrade() else {
                            debug!("Engine dropped {}, ending read task", connection);
                            break;
                        };
                        if reply_tx.send(reply).await.is_err() {
                            debug!("Write side closed, ending read task for {}", connection);
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection);
                    break;
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Ping from {}", connection);
                }
                Ok(_) => {
                    // Binary or other message types - ignore
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", connection, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", connection);
    });

    // Spawn write task (ServerMessage -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                }
            }
        }
        debug!("Write task ended for connection");

        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete, then stop the other
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", connection);
            write_task.abort();
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", connection);
            read_task.abort();
        }
    }

    engine.disconnect(connection).await;

    info!("Connection {} closed", connection);

    Ok(())
}

/// Forward one client message to the engine
///
/// Returns the direct reply for the originating connection, if any.
/// Broadcast effects reach this connection through its registered channel.
async fn dispatch(
    engine: &EngineHandle,
    connection: ConnectionId,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    let result = match msg {
        ClientMessage::CreateRoom(request) => engine
            .create_room(request)
            .await
            .map(|name| Some(ServerMessage::RoomCreated { name })),
        ClientMessage::ListRooms => engine
            .list_rooms()
            .await
            .map(|rooms| Some(ServerMessage::RoomList { rooms })),
        ClientMessage::VerifySecret { room, secret } => engine
            .verify_secret(&room, secret)
            .await
            .map(|success| Some(ServerMessage::SecretVerified { room, success })),
        ClientMessage::JoinRoom {
            room,
            username,
            secret,
        } => engine
            .join(connection, &room, &username, secret)
            .await
            .map(|outcome| Some(ServerMessage::Joined { room: outcome.room })),
        ClientMessage::LeaveRoom { room } => engine
            .leave(connection, &room)
            .await
            .map(|()| Some(ServerMessage::Left { room })),
        ClientMessage::SendMessage { room, body } => engine
            .send_message(connection, &room, &body)
            .await
            .map(|_| None),
        ClientMessage::UpdateTimer { room, timer } => engine
            .update_ttl(connection, &room, timer)
            .await
            .map(|_| None),
        ClientMessage::Typing { room } => engine
            .set_typing(connection, &room, true)
            .await
            .map(|()| None),
        ClientMessage::StopTyping { room } => engine
            .set_typing(connection, &room, false)
            .await
            .map(|()| None),
        ClientMessage::CloseRoom { room } => engine
            .close_room(connection, &room)
            .await
            .map(|()| None),
    };

    result.unwrap_or_else(|e| {
        debug!("Request from {} rejected: {}", connection, e);
        Some(e.into())
    })
}
