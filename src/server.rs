//! RoomEngine Actor implementation
//!
//! The central actor that owns all state: connections, the room directory,
//! and every room's members, messages and typing flags.
//! Uses the Actor pattern with mpsc channels for message passing; timers
//! re-enter through the same channel, so every mutation is serialized.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::EngineConfig;
use crate::directory::{NewRoom, RoomDirectory, RoomSummary};
use crate::error::{RoomError, SendError};
use crate::handle::EngineHandle;
use crate::message::{ServerMessage, ROOM_CLOSED_NOTICE};
use crate::scheduler::Scheduler;
use crate::store::{MessageView, StoredMessage};
use crate::types::{ConnectionId, MessageId};

/// Reply channel for a command
pub type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

/// What a successful join reports back to the joining connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: String,
    pub is_admin: bool,
    pub admin_username: String,
    /// Room default TTL in seconds
    pub timer: u64,
}

/// Commands processed by the RoomEngine actor
#[derive(Debug)]
pub enum EngineCommand {
    /// New connection registered with its outbound channel
    Connect {
        connection: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Connection gone; detaches it from every room
    Disconnect { connection: ConnectionId },
    /// Create a room
    CreateRoom {
        request: NewRoom,
        reply: Reply<String>,
    },
    /// Snapshot of all rooms
    ListRooms { reply: Reply<Vec<RoomSummary>> },
    /// Check a room secret
    VerifySecret {
        room: String,
        secret: Option<String>,
        reply: Reply<bool>,
    },
    /// Change a room's default TTL without an identity check
    SetRoomTtl {
        room: String,
        ttl: u64,
        reply: Reply<u64>,
    },
    /// Join a room
    Join {
        connection: ConnectionId,
        room: String,
        username: String,
        secret: Option<String>,
        reply: Reply<JoinOutcome>,
    },
    /// Leave a room (no-op if not a member)
    Leave {
        connection: ConnectionId,
        room: String,
        reply: Reply<()>,
    },
    /// Send a chat message
    SendMessage {
        connection: ConnectionId,
        room: String,
        body: String,
        reply: Reply<MessageView>,
    },
    /// Admin-gated default TTL change
    UpdateTtl {
        connection: ConnectionId,
        room: String,
        ttl: u64,
        reply: Reply<u64>,
    },
    /// Admin-gated close
    CloseRoom {
        connection: ConnectionId,
        room: String,
        reply: Reply<()>,
    },
    /// Typing flag raised or cleared
    Typing {
        connection: ConnectionId,
        room: String,
        is_typing: bool,
        reply: Reply<()>,
    },
    /// Timer: a message's TTL elapsed
    ExpireMessage { room: String, message_id: MessageId },
    /// Timer: a typing flag went stale
    ExpireTyping {
        room: String,
        key: String,
        generation: u64,
    },
    /// Timer: close grace elapsed
    PurgeRoom { room: String },
}

/// The main RoomEngine actor
///
/// Manages all state and processes commands from handles and timers.
pub struct RoomEngine {
    config: EngineConfig,
    /// All connected clients: ConnectionId -> Client
    clients: HashMap<ConnectionId, Client>,
    /// All live rooms
    directory: RoomDirectory,
    /// Connections whose outbound queue overflowed, pending disconnect
    stalled: Vec<ConnectionId>,
    /// Timer factory delivering back into `receiver`
    scheduler: Scheduler<EngineCommand>,
    /// Command receiver channel
    receiver: mpsc::Receiver<EngineCommand>,
}

impl RoomEngine {
    /// Create a new RoomEngine and the handle that talks to it
    pub fn new(config: EngineConfig) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let engine = Self {
            config,
            clients: HashMap::new(),
            directory: RoomDirectory::new(),
            stalled: Vec::new(),
            scheduler: Scheduler::new(cmd_tx.downgrade()),
            receiver: cmd_rx,
        };
        (engine, EngineHandle::new(cmd_tx))
    }

    /// Create a RoomEngine, spawn it, and return its handle
    pub fn spawn(config: EngineConfig) -> EngineHandle {
        let (engine, handle) = Self::new(config);
        tokio::spawn(engine.run());
        handle
    }

    /// Run the RoomEngine event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("RoomEngine started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("RoomEngine shutting down");
    }

    /// Process a single command, then drop connections that stopped reading
    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Connect { connection, sender } => {
                self.handle_connect(connection, sender);
            }
            EngineCommand::Disconnect { connection } => {
                self.handle_disconnect(connection);
            }
            EngineCommand::CreateRoom { request, reply } => {
                let _ = reply.send(self.handle_create_room(request));
            }
            EngineCommand::ListRooms { reply } => {
                let _ = reply.send(Ok(self.directory.list_rooms()));
            }
            EngineCommand::VerifySecret {
                room,
                secret,
                reply,
            } => {
                let _ = reply.send(self.directory.verify_secret(&room, secret.as_deref()));
            }
            EngineCommand::SetRoomTtl { room, ttl, reply } => {
                let _ = reply.send(self.handle_set_room_ttl(&room, ttl));
            }
            EngineCommand::Join {
                connection,
                room,
                username,
                secret,
                reply,
            } => {
                let result = self.handle_join(connection, &room, username, secret);
                let _ = reply.send(result);
            }
            EngineCommand::Leave {
                connection,
                room,
                reply,
            } => {
                self.handle_leave(connection, &room);
                let _ = reply.send(Ok(()));
            }
            EngineCommand::SendMessage {
                connection,
                room,
                body,
                reply,
            } => {
                let _ = reply.send(self.handle_send(connection, &room, body));
            }
            EngineCommand::UpdateTtl {
                connection,
                room,
                ttl,
                reply,
            } => {
                let _ = reply.send(self.handle_update_ttl(connection, &room, ttl));
            }
            EngineCommand::CloseRoom {
                connection,
                room,
                reply,
            } => {
                let _ = reply.send(self.handle_close(connection, &room));
            }
            EngineCommand::Typing {
                connection,
                room,
                is_typing,
                reply,
            } => {
                let result = self.handle_typing(connection, &room, is_typing);
                let _ = reply.send(result);
            }
            EngineCommand::ExpireMessage { room, message_id } => {
                self.delete_message(&room, &message_id);
            }
            EngineCommand::ExpireTyping {
                room,
                key,
                generation,
            } => {
                self.handle_typing_expired(&room, &key, generation);
            }
            EngineCommand::PurgeRoom { room } => {
                self.handle_purge(&room);
            }
        }
        self.disconnect_stalled();
    }

    /// Handle new connection
    fn handle_connect(&mut self, connection: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        info!("Connection {} registered", connection);
        self.clients.insert(connection, Client::new(connection, sender));
        debug!(
            "Total connections: {}, Total rooms: {}",
            self.clients.len(),
            self.directory.len()
        );
    }

    /// Handle connection loss: leave every joined room
    fn handle_disconnect(&mut self, connection: ConnectionId) {
        let Some(mut client) = self.clients.remove(&connection) else {
            return;
        };
        info!("Connection {} unregistered", connection);

        for room in client.take_rooms() {
            self.detach(connection, &room);
        }

        debug!(
            "Total connections: {}, Total rooms: {}",
            self.clients.len(),
            self.directory.len()
        );
    }

    /// Helper: disconnect every connection whose queue overflowed
    ///
    /// Detaching notifies the remaining members, which can overflow more
    /// queues, so this repeats until none are left.
    fn disconnect_stalled(&mut self) {
        while let Some(connection) = self.stalled.pop() {
            self.handle_disconnect(connection);
        }
    }

    /// Handle room creation
    fn handle_create_room(&mut self, request: NewRoom) -> Result<String, RoomError> {
        let room = self.directory.create_room(request, &self.config)?;
        info!(
            "Room '{}' created (limit: {:?}, password: {}, timer: {}s)",
            room.name,
            room.capacity(),
            room.has_secret(),
            room.default_ttl()
        );
        Ok(room.name.clone())
    }

    /// Handle identity-free TTL change
    fn handle_set_room_ttl(&mut self, name: &str, ttl: u64) -> Result<u64, RoomError> {
        let room = self.directory.lookup_mut(name)?;
        let ttl = room.set_default_ttl(ttl, &self.config)?;
        info!("Timer for room '{}' set to {}s", name, ttl);

        let update = ServerMessage::TimerUpdated {
            room: name.to_string(),
            timer: ttl,
        };
        fanout(&self.clients, &mut self.stalled, room.connections(), &update);
        Ok(ttl)
    }

    /// Handle room joining
    fn handle_join(
        &mut self,
        connection: ConnectionId,
        name: &str,
        username: String,
        secret: Option<String>,
    ) -> Result<JoinOutcome, RoomError> {
        let Some(client) = self.clients.get_mut(&connection) else {
            return Err(RoomError::UnknownConnection);
        };
        let room = self.directory.lookup_mut(name)?;

        room.admit(connection, &username, secret.as_deref())?;
        client.join_room(name);

        let admin_username = room.admin().unwrap_or_default().to_string();
        let outcome = JoinOutcome {
            room: name.to_string(),
            is_admin: room.is_admin(&username),
            admin_username,
            timer: room.default_ttl(),
        };
        info!(
            "Connection {} joined room '{}' as '{}' (admin: {})",
            connection, name, username, outcome.is_admin
        );

        let replay = room.messages.replay(Instant::now());
        let direct = [
            ServerMessage::RoomTimer {
                room: name.to_string(),
                timer: outcome.timer,
            },
            ServerMessage::AdminStatus {
                room: name.to_string(),
                is_admin: outcome.is_admin,
                admin_username: outcome.admin_username.clone(),
            },
            ServerMessage::ExistingMessages {
                room: name.to_string(),
                messages: replay.alive,
            },
        ];
        for msg in &direct {
            fanout(&self.clients, &mut self.stalled, [connection], msg);
        }

        for message_id in &replay.expired {
            self.delete_message(name, message_id);
        }
        self.broadcast_user_list(name);

        Ok(outcome)
    }

    /// Handle voluntary room leaving
    fn handle_leave(&mut self, connection: ConnectionId, name: &str) {
        if let Some(client) = self.clients.get_mut(&connection) {
            client.leave_room(name);
        }
        self.detach(connection, name);
    }

    /// Helper: remove a connection from a room and notify the rest
    fn detach(&mut self, connection: ConnectionId, name: &str) {
        let Ok(room) = self.directory.lookup_mut(name) else {
            return;
        };
        let Some(member) = room.remove_member(connection) else {
            return;
        };
        info!("'{}' left room '{}'", member.username, name);

        if room.is_closed() {
            return;
        }

        let cleared = room.typing.clear_connection(connection);
        let targets = room.connections();
        for typist in cleared {
            let notice = ServerMessage::UserTyping {
                room: name.to_string(),
                username: typist.username,
                is_typing: false,
            };
            fanout(&self.clients, &mut self.stalled, targets.iter().copied(), &notice);
        }
        self.broadcast_user_list(name);
    }

    /// Handle chat message
    fn handle_send(
        &mut self,
        connection: ConnectionId,
        name: &str,
        body: String,
    ) -> Result<MessageView, RoomError> {
        let room = self.directory.lookup_mut(name)?;
        room.ensure_open()?;
        let author = room
            .member(connection)
            .map(|m| m.username.clone())
            .ok_or_else(|| RoomError::NotMember(name.to_string()))?;

        let ttl = room.default_ttl();
        let mut message = StoredMessage::new(room.messages.next_id(), author, body, ttl);
        let timer = self.scheduler.schedule_at(
            message.expires_at(),
            EngineCommand::ExpireMessage {
                room: name.to_string(),
                message_id: message.id.clone(),
            },
        );
        message.set_expiry(timer);
        let view = message.view();
        room.messages.push(message);

        debug!(
            "Message {} sent in room '{}' by '{}', deleted in {}s",
            view.id, name, view.author, ttl
        );

        let targets = room.connections();
        if let Some(typist) = room.typing.stop(&view.author) {
            let notice = ServerMessage::UserTyping {
                room: name.to_string(),
                username: typist.username,
                is_typing: false,
            };
            fanout_except(
                &self.clients,
                &mut self.stalled,
                targets.iter().copied(),
                typist.connection,
                &notice,
            );
        }

        let broadcast = ServerMessage::ReceiveMessage {
            room: name.to_string(),
            message: view.clone(),
        };
        fanout(&self.clients, &mut self.stalled, targets, &broadcast);

        Ok(view)
    }

    /// Helper: delete a message exactly once
    ///
    /// The deletion notice goes out before the message leaves the log.
    /// Missing room or message is a no-op.
    fn delete_message(&mut self, name: &str, message_id: &MessageId) {
        let Ok(room) = self.directory.lookup_mut(name) else {
            debug!("Expiry for {} in vanished room '{}'", message_id, name);
            return;
        };
        if !room.messages.contains(message_id) {
            debug!("Expiry for already removed message {}", message_id);
            return;
        }

        let notice = ServerMessage::DeleteMessage {
            room: name.to_string(),
            message_id: message_id.clone(),
        };
        fanout(&self.clients, &mut self.stalled, room.connections(), &notice);
        room.messages.remove(message_id);

        debug!("Message {} deleted from room '{}'", message_id, name);
    }

    /// Handle admin timer change
    fn handle_update_ttl(
        &mut self,
        connection: ConnectionId,
        name: &str,
        ttl: u64,
    ) -> Result<u64, RoomError> {
        let room = self.directory.lookup_mut(name)?;
        let ttl = room.update_default_ttl(connection, ttl, &self.config)?;
        info!("Timer updated in room '{}' to {}s", name, ttl);

        let update = ServerMessage::TimerUpdated {
            room: name.to_string(),
            timer: ttl,
        };
        fanout(&self.clients, &mut self.stalled, room.connections(), &update);
        Ok(ttl)
    }

    /// Handle admin close; the purge follows after the grace interval
    fn handle_close(&mut self, connection: ConnectionId, name: &str) -> Result<(), RoomError> {
        let room = self.directory.lookup_mut(name)?;
        room.close(connection)?;
        info!("Room '{}' closed by admin", name);

        let notice = ServerMessage::RoomClosed {
            room: name.to_string(),
            message: ROOM_CLOSED_NOTICE.to_string(),
        };
        fanout(&self.clients, &mut self.stalled, room.connections(), &notice);

        let purge = self.scheduler.schedule(
            self.config.close_grace,
            EngineCommand::PurgeRoom {
                room: name.to_string(),
            },
        );
        room.set_purge_timer(purge);
        Ok(())
    }

    /// Handle purge: detach everyone and drop the room with its timers
    fn handle_purge(&mut self, name: &str) {
        let Some(room) = self.directory.delete_room(name) else {
            return;
        };

        let notice = ServerMessage::Left {
            room: name.to_string(),
        };
        let targets = room.connections();
        for connection in &targets {
            if let Some(client) = self.clients.get_mut(connection) {
                client.leave_room(name);
            }
        }
        fanout(&self.clients, &mut self.stalled, targets, &notice);

        info!(
            "Room '{}' purged ({} members detached, {} messages dropped)",
            name,
            room.member_count(),
            room.messages.len()
        );
    }

    /// Handle typing indicator start/stop
    fn handle_typing(
        &mut self,
        connection: ConnectionId,
        name: &str,
        is_typing: bool,
    ) -> Result<(), RoomError> {
        let room = self.directory.lookup_mut(name)?;
        room.ensure_open()?;
        let username = room
            .member(connection)
            .map(|m| m.username.clone())
            .ok_or_else(|| RoomError::NotMember(name.to_string()))?;

        let changed = if is_typing {
            let scheduler = &self.scheduler;
            let timeout = self.config.typing_timeout;
            room.typing.start(&username, connection, |key, generation| {
                scheduler.schedule(
                    timeout,
                    EngineCommand::ExpireTyping {
                        room: name.to_string(),
                        key,
                        generation,
                    },
                )
            })
        } else {
            room.typing.stop(&username).is_some()
        };

        if changed {
            let notice = ServerMessage::UserTyping {
                room: name.to_string(),
                username,
                is_typing,
            };
            fanout_except(
                &self.clients,
                &mut self.stalled,
                room.connections(),
                connection,
                &notice,
            );
        }
        Ok(())
    }

    /// Handle typing flag inactivity timeout
    fn handle_typing_expired(&mut self, name: &str, key: &str, generation: u64) {
        let Ok(room) = self.directory.lookup_mut(name) else {
            return;
        };
        let Some(typist) = room.typing.expire(key, generation) else {
            debug!("Stale typing expiry for '{}' in room '{}'", key, name);
            return;
        };

        let notice = ServerMessage::UserTyping {
            room: name.to_string(),
            username: typist.username,
            is_typing: false,
        };
        fanout_except(
            &self.clients,
            &mut self.stalled,
            room.connections(),
            typist.connection,
            &notice,
        );
    }

    /// Helper: send the current username list to the whole room
    fn broadcast_user_list(&mut self, name: &str) {
        let Ok(room) = self.directory.lookup(name) else {
            return;
        };
        let list = ServerMessage::UserList {
            room: name.to_string(),
            users: room.usernames(),
        };
        fanout(&self.clients, &mut self.stalled, room.connections(), &list);
    }
}

/// Deliver `msg` to every target connection still registered
///
/// Never waits: a connection whose queue is full misses the event and is
/// recorded in `stalled` for disconnection.
fn fanout<I>(
    clients: &HashMap<ConnectionId, Client>,
    stalled: &mut Vec<ConnectionId>,
    targets: I,
    msg: &ServerMessage,
) where
    I: IntoIterator<Item = ConnectionId>,
{
    for connection in targets {
        let Some(client) = clients.get(&connection) else {
            continue;
        };
        match client.send(msg.clone()) {
            Ok(()) => {}
            Err(SendError::ChannelClosed) => {
                debug!("Dropped event for closed connection {}", connection);
            }
            Err(SendError::Full) => {
                if !stalled.contains(&connection) {
                    warn!("Connection {} is not reading its events, disconnecting", connection);
                    stalled.push(connection);
                }
            }
        }
    }
}

/// Deliver `msg` to every target except `origin`
fn fanout_except<I>(
    clients: &HashMap<ConnectionId, Client>,
    stalled: &mut Vec<ConnectionId>,
    targets: I,
    origin: ConnectionId,
    msg: &ServerMessage,
) where
    I: IntoIterator<Item = ConnectionId>,
{
    let targets = targets.into_iter().filter(|c| *c != origin);
    fanout(clients, stalled, targets, msg);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::AppError;

    struct Peer {
        id: ConnectionId,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl Peer {
        async fn connect(handle: &EngineHandle) -> Self {
            Self::with_buffer(handle, 64).await
        }

        async fn with_buffer(handle: &EngineHandle, buffer: usize) -> Self {
            let (tx, rx) = mpsc::channel(buffer);
            let id = ConnectionId::new();
            handle.connect(id, tx).await.unwrap();
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }

        async fn next(&mut self) -> ServerMessage {
            self.rx.recv().await.expect("engine dropped connection")
        }
    }

    fn room_error<T: std::fmt::Debug>(result: Result<T, AppError>) -> RoomError {
        match result {
            Err(AppError::Room(err)) => err,
            other => panic!("expected room error, got {:?}", other),
        }
    }

    fn room_with_ttl(name: &str, ttl: u64) -> NewRoom {
        NewRoom {
            ttl: Some(ttl),
            ..NewRoom::named(name)
        }
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let handle = RoomEngine::spawn(EngineConfig::default());

        handle.create_room(NewRoom::named("general")).await.unwrap();
        handle
            .create_room(NewRoom {
                secret: Some("pw".to_string()),
                ..NewRoom::named("vault")
            })
            .await
            .unwrap();

        let rooms = handle.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].name, "general");
        assert!(!rooms[0].has_password);
        assert_eq!(rooms[0].limit, Some(1000));
        assert!(rooms[1].has_password);

        assert!(handle.verify_secret("vault", Some("pw".to_string())).await.unwrap());
        assert!(!handle.verify_secret("vault", None).await.unwrap());
        assert!(matches!(
            room_error(handle.verify_secret("nowhere", None).await),
            RoomError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_first_room() {
        let handle = RoomEngine::spawn(EngineConfig::default());

        handle.create_room(room_with_ttl("general", 30)).await.unwrap();
        let err = room_error(handle.create_room(NewRoom::named("general")).await);

        assert_eq!(err, RoomError::Duplicate("general".to_string()));
        let rooms = handle.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].timer, 30);
    }

    #[tokio::test]
    async fn test_join_side_effects() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(room_with_ttl("general", 45)).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;

        let outcome = handle.join(alice.id, "general", "alice", None).await.unwrap();
        assert!(outcome.is_admin);
        assert_eq!(outcome.timer, 45);

        let events = alice.drain();
        assert_eq!(
            events,
            vec![
                ServerMessage::RoomTimer {
                    room: "general".to_string(),
                    timer: 45,
                },
                ServerMessage::AdminStatus {
                    room: "general".to_string(),
                    is_admin: true,
                    admin_username: "alice".to_string(),
                },
                ServerMessage::ExistingMessages {
                    room: "general".to_string(),
                    messages: vec![],
                },
                ServerMessage::UserList {
                    room: "general".to_string(),
                    users: vec!["alice".to_string()],
                },
            ]
        );

        let outcome = handle.join(bob.id, "general", "bob", None).await.unwrap();
        assert!(!outcome.is_admin);
        assert_eq!(outcome.admin_username, "alice");

        let expected = ServerMessage::UserList {
            room: "general".to_string(),
            users: vec!["alice".to_string(), "bob".to_string()],
        };
        assert_eq!(alice.drain(), vec![expected.clone()]);
        assert_eq!(bob.drain().last(), Some(&expected));
    }

    #[tokio::test]
    async fn test_wrong_secret_never_registers() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle
            .create_room(NewRoom {
                secret: Some("pw".to_string()),
                ..NewRoom::named("vault")
            })
            .await
            .unwrap();
        let mut eve = Peer::connect(&handle).await;
        let alice = Peer::connect(&handle).await;

        let err = room_error(handle.join(eve.id, "vault", "eve", Some("guess".to_string())).await);
        assert_eq!(err, RoomError::WrongSecret);
        assert!(eve.drain().is_empty());
        assert_eq!(handle.list_rooms().await.unwrap()[0].users, 0);

        let outcome = handle
            .join(alice.id, "vault", "alice", Some("pw".to_string()))
            .await
            .unwrap();
        assert!(outcome.is_admin);
    }

    #[tokio::test]
    async fn test_admin_not_overridden_after_leave() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let alice = Peer::connect(&handle).await;
        let bob = Peer::connect(&handle).await;

        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        handle.leave(alice.id, "general").await.unwrap();

        assert!(matches!(
            room_error(handle.update_ttl(bob.id, "general", 30).await),
            RoomError::Forbidden { .. }
        ));
        assert!(matches!(
            room_error(handle.close_room(bob.id, "general").await),
            RoomError::Forbidden { .. }
        ));
        let rooms = handle.list_rooms().await.unwrap();
        assert_eq!(rooms[0].timer, 60);
        assert_eq!(rooms[0].users, 1);
    }

    #[tokio::test]
    async fn test_leave_keeps_empty_room() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let alice = Peer::connect(&handle).await;

        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.leave(alice.id, "general").await.unwrap();
        handle.leave(alice.id, "general").await.unwrap();
        handle.leave(alice.id, "nowhere").await.unwrap();

        let rooms = handle.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].users, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_lifecycle() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(room_with_ttl("general", 10)).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        alice.drain();

        let sent_at = Instant::now();
        let view = handle.send_message(alice.id, "general", "hello").await.unwrap();
        assert_eq!(view.ttl, 10);
        assert_eq!(view.author, "alice");
        assert_eq!(
            alice.drain(),
            vec![ServerMessage::ReceiveMessage {
                room: "general".to_string(),
                message: view.clone(),
            }]
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        let replayed = bob
            .drain()
            .into_iter()
            .find_map(|event| match event {
                ServerMessage::ExistingMessages { messages, .. } => Some(messages),
                _ => None,
            })
            .unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, view.id);
        assert_eq!(replayed[0].ttl, 5);
        alice.drain();

        let deleted = ServerMessage::DeleteMessage {
            room: "general".to_string(),
            message_id: view.id.clone(),
        };
        assert_eq!(alice.next().await, deleted);
        assert_eq!(bob.next().await, deleted);
        assert!(sent_at.elapsed() >= Duration::from_secs(10));

        let mut carol = Peer::connect(&handle).await;
        handle.join(carol.id, "general", "carol", None).await.unwrap();
        assert!(carol.drain().contains(&ServerMessage::ExistingMessages {
            room: "general".to_string(),
            messages: vec![],
        }));
        assert!(alice.drain().iter().all(|e| !matches!(e, ServerMessage::DeleteMessage { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_change_leaves_inflight_messages() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();

        let slow = handle.send_message(alice.id, "general", "slow").await.unwrap();
        assert_eq!(handle.update_ttl(alice.id, "general", 30).await.unwrap(), 30);
        let fast = handle.send_message(alice.id, "general", "fast").await.unwrap();
        assert_eq!(slow.ttl, 60);
        assert_eq!(fast.ttl, 30);
        assert!(alice.drain().contains(&ServerMessage::TimerUpdated {
            room: "general".to_string(),
            timer: 30,
        }));

        let start = Instant::now();
        assert_eq!(
            alice.next().await,
            ServerMessage::DeleteMessage {
                room: "general".to_string(),
                message_id: fast.id.clone(),
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(
            alice.next().await,
            ServerMessage::DeleteMessage {
                room: "general".to_string(),
                message_id: slow.id.clone(),
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_update_ttl_rejections() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let alice = Peer::connect(&handle).await;
        let stranger = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();

        assert!(matches!(
            room_error(handle.update_ttl(alice.id, "general", 3601).await),
            RoomError::InvalidTtl { .. }
        ));
        assert!(matches!(
            room_error(handle.update_ttl(stranger.id, "general", 30).await),
            RoomError::Forbidden { .. }
        ));
        assert!(matches!(
            room_error(handle.update_ttl(alice.id, "nowhere", 30).await),
            RoomError::NotFound(_)
        ));
        assert_eq!(handle.list_rooms().await.unwrap()[0].timer, 60);
    }

    #[tokio::test]
    async fn test_set_room_ttl_without_identity() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        alice.drain();

        assert_eq!(handle.set_room_ttl("general", 120).await.unwrap(), 120);
        assert_eq!(
            alice.drain(),
            vec![ServerMessage::TimerUpdated {
                room: "general".to_string(),
                timer: 120,
            }]
        );
        assert!(matches!(
            room_error(handle.set_room_ttl("general", 1).await),
            RoomError::InvalidTtl { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_requires_membership() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        let outsider = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        alice.drain();

        assert_eq!(
            room_error(handle.send_message(outsider.id, "general", "hi").await),
            RoomError::NotMember("general".to_string())
        );
        assert!(matches!(
            room_error(handle.send_message(alice.id, "nowhere", "hi").await),
            RoomError::NotFound(_)
        ));
        assert!(alice.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_then_purge() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        handle.send_message(bob.id, "general", "bye").await.unwrap();
        alice.drain();
        bob.drain();

        handle.close_room(alice.id, "general").await.unwrap();
        let closed = ServerMessage::RoomClosed {
            room: "general".to_string(),
            message: ROOM_CLOSED_NOTICE.to_string(),
        };
        assert_eq!(bob.drain(), vec![closed]);

        assert_eq!(
            room_error(handle.send_message(bob.id, "general", "hi").await),
            RoomError::Closed
        );
        assert_eq!(
            room_error(handle.update_ttl(alice.id, "general", 30).await),
            RoomError::Closed
        );
        let carol = Peer::connect(&handle).await;
        assert_eq!(
            room_error(handle.join(carol.id, "general", "carol", None).await),
            RoomError::Closed
        );
        assert_eq!(
            room_error(handle.close_room(alice.id, "general").await),
            RoomError::Closed
        );

        let left = ServerMessage::Left {
            room: "general".to_string(),
        };
        assert_eq!(bob.next().await, left);
        assert_eq!(alice.drain().last(), Some(&left));

        assert!(handle.list_rooms().await.unwrap().is_empty());
        assert!(matches!(
            room_error(handle.send_message(bob.id, "general", "hi").await),
            RoomError::NotFound(_)
        ));
        assert!(matches!(
            room_error(handle.join(carol.id, "general", "carol", None).await),
            RoomError::NotFound(_)
        ));
        assert!(matches!(
            room_error(handle.update_ttl(alice.id, "general", 30).await),
            RoomError::NotFound(_)
        ));

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(alice.drain().is_empty());
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn test_room_name_reusable_after_purge() {
        let config = EngineConfig {
            close_grace: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let handle = RoomEngine::spawn(config);
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.close_room(alice.id, "general").await.unwrap();

        while alice.next().await
            != (ServerMessage::Left {
                room: "general".to_string(),
            })
        {}

        handle.create_room(NewRoom::named("general")).await.unwrap();
        let outcome = handle.join(alice.id, "general", "alice2", None).await.unwrap();
        assert!(outcome.is_admin);
    }

    #[tokio::test]
    async fn test_concurrent_joins_respect_capacity() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle
            .create_room(NewRoom {
                capacity: Some(1),
                ..NewRoom::named("solo")
            })
            .await
            .unwrap();
        let first = Peer::connect(&handle).await;
        let second = Peer::connect(&handle).await;

        let (a, b) = tokio::join!(
            handle.join(first.id, "solo", "first", None),
            handle.join(second.id, "solo", "second", None)
        );

        let results = [a, b];
        let joined = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::Room(RoomError::Full))))
            .count();
        assert_eq!(joined, 1);
        assert_eq!(full, 1);

        let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
        assert!(winner.is_admin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_signals() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        alice.drain();
        bob.drain();

        handle.set_typing(alice.id, "general", true).await.unwrap();
        handle.set_typing(alice.id, "general", true).await.unwrap();
        let typing = ServerMessage::UserTyping {
            room: "general".to_string(),
            username: "alice".to_string(),
            is_typing: true,
        };
        assert_eq!(bob.drain(), vec![typing]);
        assert!(alice.drain().is_empty());

        handle.set_typing(alice.id, "general", false).await.unwrap();
        handle.set_typing(alice.id, "general", false).await.unwrap();
        let stopped = ServerMessage::UserTyping {
            room: "general".to_string(),
            username: "alice".to_string(),
            is_typing: false,
        };
        assert_eq!(bob.drain(), vec![stopped]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_once() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let mut alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        alice.drain();
        bob.drain();

        let start = Instant::now();
        handle.set_typing(alice.id, "general", true).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        handle.set_typing(alice.id, "general", true).await.unwrap();
        bob.drain();

        assert_eq!(
            bob.next().await,
            ServerMessage::UserTyping {
                room: "general".to_string(),
                username: "alice".to_string(),
                is_typing: false,
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(bob.drain().is_empty());
        assert!(alice.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_clears_typing() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        handle.set_typing(alice.id, "general", true).await.unwrap();
        bob.drain();

        let view = handle.send_message(alice.id, "general", "done").await.unwrap();
        assert_eq!(
            bob.drain(),
            vec![
                ServerMessage::UserTyping {
                    room: "general".to_string(),
                    username: "alice".to_string(),
                    is_typing: false,
                },
                ServerMessage::ReceiveMessage {
                    room: "general".to_string(),
                    message: view,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_typing_requires_membership() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        let outsider = Peer::connect(&handle).await;

        assert_eq!(
            room_error(handle.set_typing(outsider.id, "general", true).await),
            RoomError::NotMember("general".to_string())
        );
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        handle.create_room(NewRoom::named("attic")).await.unwrap();
        let alice = Peer::connect(&handle).await;
        let mut bob = Peer::connect(&handle).await;
        handle.join(alice.id, "general", "alice", None).await.unwrap();
        handle.join(alice.id, "attic", "alice", None).await.unwrap();
        handle.join(bob.id, "general", "bob", None).await.unwrap();
        handle.set_typing(alice.id, "general", true).await.unwrap();
        bob.drain();

        handle.disconnect(alice.id).await;
        let rooms = handle.list_rooms().await.unwrap();
        assert!(rooms.iter().all(|r| r.users <= 1));
        assert_eq!(
            bob.drain(),
            vec![
                ServerMessage::UserTyping {
                    room: "general".to_string(),
                    username: "alice".to_string(),
                    is_typing: false,
                },
                ServerMessage::UserList {
                    room: "general".to_string(),
                    users: vec!["bob".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_connection_rejected() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();

        assert_eq!(
            room_error(handle.join(ConnectionId::new(), "general", "ghost", None).await),
            RoomError::UnknownConnection
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reader_does_not_stall_engine() {
        let handle = RoomEngine::spawn(EngineConfig::default());
        handle.create_room(NewRoom::named("general")).await.unwrap();
        handle.create_room(room_with_ttl("attic", 10)).await.unwrap();

        // Four slots, filled exactly by its own join and never read
        let mut idle = Peer::with_buffer(&handle, 4).await;
        handle.join(idle.id, "general", "idle", None).await.unwrap();
        let mut bob = Peer::connect(&handle).await;
        handle.join(bob.id, "general", "bob", None).await.unwrap();

        assert_eq!(
            bob.drain().last(),
            Some(&ServerMessage::UserList {
                room: "general".to_string(),
                users: vec!["bob".to_string()],
            })
        );

        let mut carol = Peer::connect(&handle).await;
        handle.join(carol.id, "attic", "carol", None).await.unwrap();
        let view = handle.send_message(carol.id, "attic", "still here").await.unwrap();
        carol.drain();
        assert_eq!(
            carol.next().await,
            ServerMessage::DeleteMessage {
                room: "attic".to_string(),
                message_id: view.id,
            }
        );

        let rooms = handle.list_rooms().await.unwrap();
        assert_eq!(rooms[1].name, "general");
        assert_eq!(rooms[1].users, 1);
        assert_eq!(
            room_error(handle.send_message(idle.id, "general", "hi").await),
            RoomError::NotMember("general".to_string())
        );

        // The queued events stay readable, then the channel closes
        assert_eq!(idle.drain().len(), 4);
        assert_eq!(idle.rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_deleted_on_join_not_replayed() {
        let (mut engine, _handle) = RoomEngine::new(EngineConfig::default());
        let (alice_tx, mut alice) = mpsc::channel(64);
        let (bob_tx, mut bob) = mpsc::channel(64);
        let alice_id = ConnectionId::new();
        let bob_id = ConnectionId::new();
        engine.handle_command(EngineCommand::Connect {
            connection: alice_id,
            sender: alice_tx,
        });
        engine.handle_command(EngineCommand::Connect {
            connection: bob_id,
            sender: bob_tx,
        });

        let (reply, created) = oneshot::channel();
        engine.handle_command(EngineCommand::CreateRoom {
            request: room_with_ttl("general", 10),
            reply,
        });
        created.await.unwrap().unwrap();

        let (reply, joined) = oneshot::channel();
        engine.handle_command(EngineCommand::Join {
            connection: alice_id,
            room: "general".to_string(),
            username: "alice".to_string(),
            secret: None,
            reply,
        });
        joined.await.unwrap().unwrap();

        let (reply, sent) = oneshot::channel();
        engine.handle_command(EngineCommand::SendMessage {
            connection: alice_id,
            room: "general".to_string(),
            body: "hello".to_string(),
            reply,
        });
        let view = sent.await.unwrap().unwrap();
        while alice.try_recv().is_ok() {}

        // Hold the expiry the timer posted and run the join first
        let expiry = engine.receiver.recv().await.unwrap();
        assert!(matches!(
            &expiry,
            EngineCommand::ExpireMessage { message_id, .. } if *message_id == view.id
        ));

        let (reply, joined) = oneshot::channel();
        engine.handle_command(EngineCommand::Join {
            connection: bob_id,
            room: "general".to_string(),
            username: "bob".to_string(),
            secret: None,
            reply,
        });
        joined.await.unwrap().unwrap();

        let deleted = ServerMessage::DeleteMessage {
            room: "general".to_string(),
            message_id: view.id.clone(),
        };
        let mut bob_events = Vec::new();
        while let Ok(event) = bob.try_recv() {
            bob_events.push(event);
        }
        assert!(bob_events.contains(&ServerMessage::ExistingMessages {
            room: "general".to_string(),
            messages: vec![],
        }));
        let mut alice_events = Vec::new();
        while let Ok(event) = alice.try_recv() {
            alice_events.push(event);
        }
        assert_eq!(alice_events.iter().filter(|e| **e == deleted).count(), 1);

        engine.handle_command(expiry);
        assert!(alice.try_recv().is_err());
        assert!(bob.try_recv().is_err());
    }
}
