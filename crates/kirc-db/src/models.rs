/// Database row types, mapped directly from SQLite rows.
/// Distinct from kirc-types models to keep the DB layer independent.

pub struct MessageRow {
    pub id: i64,
    pub message_id: String,
    pub message_type: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub channel: Option<String>,
    pub content: String,
    pub timestamp_ms: i64,
    pub is_outbound: bool,
    pub is_read: bool,
}

/// A channel key sealed to the local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKeyRow {
    pub channel: String,
    pub key_id: String,
    pub sealed_key: String,
    /// Insertion order; the newest key becomes active again on restore
    pub created_at: i64,
}
