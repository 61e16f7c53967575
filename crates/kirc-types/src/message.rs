use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{KircError, Result};
use crate::models::HistoryEntry;

/// Every message kind that travels over the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Data messages
    Chat,
    Direct,
    Broadcast,

    // RPC messages
    Ping,
    Pong,
    Presence,
    Typing,
    Ack,
    FetchHistory,
    HistoryData,
    ChannelKeyUpdate,
}

impl MessageType {
    pub const ALL: [MessageType; 11] = [
        Self::Chat,
        Self::Direct,
        Self::Broadcast,
        Self::Ping,
        Self::Pong,
        Self::Presence,
        Self::Typing,
        Self::Ack,
        Self::FetchHistory,
        Self::HistoryData,
        Self::ChannelKeyUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Direct => "direct",
            Self::Broadcast => "broadcast",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Presence => "presence",
            Self::Typing => "typing",
            Self::Ack => "ack",
            Self::FetchHistory => "fetch_history",
            Self::HistoryData => "history_data",
            Self::ChannelKeyUpdate => "channel_key_update",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = KircError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| KircError::Malformed(format!("unknown message type: {}", s)))
    }
}

// -- Wire markers --
//
// UUIDs, timestamps and enumerations are wrapped in single-key maps so they
// survive a trip through the schemaless binary encoding with their type.

#[derive(Serialize, Deserialize)]
struct UuidTag {
    #[serde(rename = "__uuid__")]
    value: String,
}

#[derive(Serialize, Deserialize)]
struct DateTimeTag {
    #[serde(rename = "__datetime__")]
    value: String,
}

#[derive(Serialize, Deserialize)]
struct EnumTag {
    #[serde(rename = "__enum__")]
    value: String,
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        EnumTag {
            value: self.as_str().to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = EnumTag::deserialize(deserializer)?;
        tag.value.parse().map_err(serde::de::Error::custom)
    }
}

mod tagged_uuid {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Uuid, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        UuidTag {
            value: id.to_string(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Uuid, D::Error> {
        let tag = UuidTag::deserialize(deserializer)?;
        Uuid::parse_str(&tag.value).map_err(serde::de::Error::custom)
    }
}

mod tagged_uuid_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        id: &Option<Uuid>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        id.map(|id| UuidTag {
            value: id.to_string(),
        })
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Uuid>, D::Error> {
        Option::<UuidTag>::deserialize(deserializer)?
            .map(|tag| Uuid::parse_str(&tag.value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod tagged_datetime {
    use super::*;

    pub fn serialize<S: Serializer>(
        ts: &DateTime<Utc>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        DateTimeTag {
            value: ts.to_rfc3339(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let tag = DateTimeTag::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&tag.value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Message body. Binary fields (ciphertexts, sealed blobs) are base64 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Empty,

    /// Plaintext chat or direct content
    Text { content: String },

    /// Content encrypted under a channel key
    Encrypted {
        ciphertext: String,
        #[serde(default)]
        key_id: Option<String>,
    },

    /// Content sealed to the recipient's public key
    Sealed { ciphertext: String },

    FetchHistory { channel: String, limit: u32 },

    /// A page of channel history. When `is_encrypted` is false the page is in
    /// `entries`; otherwise `sealed_page` holds the compacted, sealed page.
    HistoryData {
        channel: String,
        is_encrypted: bool,
        #[serde(default)]
        entries: Vec<HistoryEntry>,
        #[serde(default)]
        sealed_page: Option<String>,
    },

    ChannelKeyUpdate {
        channel: String,
        key_id: String,
        sealed_key: String,
    },
}

/// The envelope every broker record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "tagged_uuid")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(with = "tagged_datetime")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "tagged_uuid_opt")]
    pub correlation_id: Option<Uuid>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(kind: MessageType, sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender: sender.into(),
            recipient: None,
            channel: None,
            timestamp: Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build a response addressed back to this message's sender, carrying the
    /// same correlation id.
    pub fn reply(&self, kind: MessageType, sender: impl Into<String>, payload: Payload) -> Self {
        let mut reply = Envelope::new(kind, sender, payload).to(self.sender.clone());
        reply.channel = self.channel.clone();
        reply.correlation_id = self.correlation_id;
        reply
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| KircError::Malformed(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(data).map_err(|e| KircError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_survives_binary_encoding() {
        let env = Envelope::new(
            MessageType::Chat,
            "alice",
            Payload::Encrypted {
                ciphertext: "AAAA".into(),
                key_id: Some("k1".into()),
            },
        )
        .in_channel("general")
        .with_correlation(Uuid::new_v4());

        let bytes = env.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn typed_values_carry_wire_markers() {
        let env = Envelope::new(MessageType::FetchHistory, "bob", Payload::Empty);
        let bytes = env.to_bytes().unwrap();

        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["id"]["__uuid__"], env.id.to_string());
        assert_eq!(value["type"]["__enum__"], "fetch_history");
        assert!(value["timestamp"]["__datetime__"].is_string());
    }

    #[test]
    fn history_page_in_the_clear() {
        let entries = vec![HistoryEntry {
            id: Uuid::new_v4().to_string(),
            sender: "carol".into(),
            content: "hi".into(),
            timestamp_ms: 1_700_000_000_000,
        }];
        let env = Envelope::new(
            MessageType::HistoryData,
            "leader",
            Payload::HistoryData {
                channel: "general".into(),
                is_encrypted: false,
                entries: entries.clone(),
                sealed_page: None,
            },
        );

        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        match decoded.payload {
            Payload::HistoryData {
                is_encrypted,
                entries: got,
                ..
            } => {
                assert!(!is_encrypted);
                assert_eq!(got, entries);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn reply_keeps_correlation() {
        let request = Envelope::new(MessageType::Ping, "alice", Payload::Empty)
            .with_correlation(Uuid::new_v4());
        let reply = request.reply(MessageType::Pong, "bob", Payload::Empty);

        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.recipient.as_deref(), Some("alice"));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Envelope::from_bytes(b"\xc1not msgpack").unwrap_err();
        assert!(matches!(err, KircError::Malformed(_)));
    }

    #[test]
    fn unknown_type_rejected() {
        assert!("telegram".parse::<MessageType>().is_err());
        assert_eq!(
            "channel_key_update".parse::<MessageType>().unwrap(),
            MessageType::ChannelKeyUpdate
        );
    }
}
