use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Coordination pub/sub payloads --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub username: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub channel: String,
    pub username: String,
    pub is_typing: bool,
}

/// Published after a key rotation. Never carries the key itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub channel: String,
    pub key_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub channel: String,
    pub username: String,
    pub action: MembershipAction,
}

/// Direct notification published on `notify:{user}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub sender: String,
    pub kind: String,
    pub body: String,
}

/// A decoded coordination-store event.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordEvent {
    Presence(PresenceEvent),
    Typing(TypingEvent),
    Rotation(RotationEvent),
    Membership(MembershipEvent),
    Notification(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordEventKind {
    Presence,
    Typing,
    Rotation,
    Membership,
    Notification,
}

impl CoordEvent {
    pub fn kind(&self) -> CoordEventKind {
        match self {
            Self::Presence(_) => CoordEventKind::Presence,
            Self::Typing(_) => CoordEventKind::Typing,
            Self::Rotation(_) => CoordEventKind::Rotation,
            Self::Membership(_) => CoordEventKind::Membership,
            Self::Notification(_) => CoordEventKind::Notification,
        }
    }
}

// -- Presentation events --

/// A message ready to show, already decrypted (or marked locked).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub id: String,
    pub channel: Option<String>,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// True when no channel key could open the message
    pub locked: bool,
}

/// Events the relay emits for whatever host renders the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayEvent {
    /// A message for the currently open channel
    MessageRendered(DisplayMessage),

    /// History received after opening a channel
    HistoryLoaded {
        channel: String,
        messages: Vec<DisplayMessage>,
        /// False when the leader sent the page in the clear
        is_encrypted: bool,
    },

    DirectReceived(DisplayMessage),

    PresenceUpdate { username: String, status: String },

    TypingUpdate {
        channel: String,
        username: String,
        is_typing: bool,
    },

    MembershipUpdate {
        channel: String,
        username: String,
        joined: bool,
    },

    /// A rotation signal was observed. `key_known` is false until the sealed
    /// key update for this node arrives (or never, without a stored public key).
    KeyRotated {
        channel: String,
        key_id: String,
        key_known: bool,
    },

    LeaderChanged {
        channel: String,
        leader: Option<String>,
    },
}

impl RelayEvent {
    /// Returns the channel this event is scoped to, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::MessageRendered(msg) => msg.channel.as_deref(),
            Self::HistoryLoaded { channel, .. }
            | Self::TypingUpdate { channel, .. }
            | Self::MembershipUpdate { channel, .. }
            | Self::KeyRotated { channel, .. }
            | Self::LeaderChanged { channel, .. } => Some(channel),
            // DirectReceived and PresenceUpdate are global
            _ => None,
        }
    }
}
