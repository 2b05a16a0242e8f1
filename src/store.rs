//! Per-room message log
//!
//! Messages are appended on send and removed exactly once, either by their
//! expiry timer or by the room being purged. Each stored message owns the
//! handle of its pending deletion, so removing the message cancels it.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::scheduler::TimerHandle;
use crate::types::{epoch_millis, MessageId};

/// Client-facing view of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: MessageId,
    /// Author username
    #[serde(rename = "username")]
    pub author: String,
    /// Message text
    #[serde(rename = "message")]
    pub body: String,
    /// Creation time, epoch milliseconds
    pub timestamp: u64,
    /// Seconds until deletion
    #[serde(rename = "timer")]
    pub ttl: u64,
}

/// A message held in a room's log
#[derive(Debug)]
pub struct StoredMessage {
    pub id: MessageId,
    pub author: String,
    pub body: String,
    /// Creation time, epoch milliseconds
    pub timestamp: u64,
    /// Monotonic creation time used for expiry arithmetic
    pub created_at: Instant,
    /// TTL in seconds, captured at creation
    pub ttl: u64,
    expiry: Option<TimerHandle>,
}

impl StoredMessage {
    /// Create a message sent now with the given TTL
    pub fn new(id: MessageId, author: String, body: String, ttl: u64) -> Self {
        Self {
            id,
            author,
            body,
            timestamp: epoch_millis(),
            created_at: Instant::now(),
            ttl,
            expiry: None,
        }
    }

    /// Instant at which the message must be deleted
    pub fn expires_at(&self) -> Instant {
        self.created_at + Duration::from_secs(self.ttl)
    }

    /// Time left before deletion, floored at zero
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    /// Attach the pending deletion timer
    pub fn set_expiry(&mut self, timer: TimerHandle) {
        self.expiry = Some(timer);
    }

    /// View with the TTL captured at send time
    pub fn view(&self) -> MessageView {
        self.view_with_ttl(self.ttl)
    }

    /// View re-timed to the remaining TTL (whole seconds, rounded up)
    pub fn view_remaining(&self, now: Instant) -> MessageView {
        let remaining = self.remaining(now);
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        self.view_with_ttl(secs)
    }

    fn view_with_ttl(&self, ttl: u64) -> MessageView {
        MessageView {
            id: self.id.clone(),
            author: self.author.clone(),
            body: self.body.clone(),
            timestamp: self.timestamp,
            ttl,
        }
    }
}

/// Replay of a log for a late joiner
#[derive(Debug, Default)]
pub struct Replay {
    /// Alive messages, re-timed to their remaining TTL, in send order
    pub alive: Vec<MessageView>,
    /// Messages whose TTL already elapsed and must be deleted now
    pub expired: Vec<MessageId>,
}

/// Append-only message log for one room
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<StoredMessage>,
}

impl MessageLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an id not used by any message currently in the log
    pub fn next_id(&self) -> MessageId {
        loop {
            let id = MessageId::generate();
            if !self.contains(&id) {
                break id;
            }
        }
    }

    /// Append a message
    pub fn push(&mut self, message: StoredMessage) {
        self.messages.push(message);
    }

    /// Check if a message is still in the log
    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    /// Remove a message, cancelling its pending deletion timer
    pub fn remove(&mut self, id: &MessageId) -> Option<StoredMessage> {
        let index = self.messages.iter().position(|m| &m.id == id)?;
        let mut message = self.messages.remove(index);
        if let Some(timer) = message.expiry.take() {
            timer.cancel();
        }
        Some(message)
    }

    /// Split the log into alive messages (re-timed) and expired ids
    pub fn replay(&self, now: Instant) -> Replay {
        let mut replay = Replay::default();
        for message in &self.messages {
            if message.remaining(now).is_zero() {
                replay.expired.push(message.id.clone());
            } else {
                replay.alive.push(message.view_remaining(now));
            }
        }
        replay
    }

    /// Number of messages in the log
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
