use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageType;

/// The local node's own profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    pub display_name: String,
    /// Base64 public key, shared with contacts out of band
    pub public_key: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A peer in the contact list. A stored public key is what makes the peer
/// eligible for sealed key updates and sealed history pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub username: String,
    pub display_name: Option<String>,
    /// Broker endpoint the peer advertised
    pub endpoint: String,
    pub public_key: Option<String>,
    pub notes: Option<String>,
    pub is_blocked: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(username: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: None,
            endpoint: endpoint.into(),
            public_key: None,
            notes: None,
            is_blocked: false,
            last_seen: None,
        }
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub description: Option<String>,
    pub is_joined: bool,
    pub created_at: DateTime<Utc>,
}

/// A decrypted message as kept in the durable store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Local snowflake id, also the chronological sort key
    pub id: i64,
    /// Envelope id, unique across the network
    pub message_id: String,
    pub kind: MessageType,
    pub sender: String,
    pub recipient: Option<String>,
    pub channel: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_outbound: bool,
    pub is_read: bool,
}

impl StoredMessage {
    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            id: self.message_id.clone(),
            sender: self.sender.clone(),
            content: self.content.clone(),
            timestamp_ms: self.timestamp.timestamp_millis(),
        }
    }
}

/// One message in a history page. Kept flat so pages compact well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp_ms: i64,
}

impl HistoryEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }
}
