use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

use kirc_types::MessageType;
use kirc_types::models::{Channel, Contact, Profile, StoredMessage};

use crate::Database;
use crate::models::{ChannelKeyRow, MessageRow};

impl Database {
    // -- Profile --

    pub fn save_profile(&self, profile: &Profile) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profile (username, display_name, public_key, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(username) DO UPDATE SET
                    display_name = excluded.display_name,
                    public_key = excluded.public_key,
                    status = excluded.status",
                rusqlite::params![
                    profile.username,
                    profile.display_name,
                    profile.public_key,
                    profile.status,
                    profile.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self) -> Result<Option<Profile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT username, display_name, public_key, status, created_at FROM profile LIMIT 1",
                [],
                |row| {
                    Ok(Profile {
                        username: row.get(0)?,
                        display_name: row.get(1)?,
                        public_key: row.get(2)?,
                        status: row.get(3)?,
                        created_at: parse_ts(row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()
        })
    }

    // -- Contacts --

    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (username, display_name, endpoint, public_key, notes, is_blocked, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(username) DO UPDATE SET
                    display_name = excluded.display_name,
                    endpoint = excluded.endpoint,
                    public_key = excluded.public_key,
                    notes = excluded.notes,
                    is_blocked = excluded.is_blocked,
                    last_seen = excluded.last_seen",
                rusqlite::params![
                    contact.username,
                    contact.display_name,
                    contact.endpoint,
                    contact.public_key,
                    contact.notes,
                    contact.is_blocked,
                    contact.last_seen.map(|ts| ts.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_contact(&self, username: &str) -> Result<Option<Contact>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT username, display_name, endpoint, public_key, notes, is_blocked, last_seen
                 FROM contacts WHERE username = ?1",
                [username],
                contact_from_row,
            )
            .optional()
        })
    }

    pub fn get_contacts(&self, include_blocked: bool) -> Result<Vec<Contact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, display_name, endpoint, public_key, notes, is_blocked, last_seen
                 FROM contacts WHERE ?1 OR is_blocked = 0 ORDER BY username",
            )?;
            let rows = stmt
                .query_map([include_blocked], contact_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns true if a contact was removed.
    pub fn delete_contact(&self, username: &str) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM contacts WHERE username = ?1", [username])? > 0)
        })
    }

    // -- Channels --

    pub fn save_channel(&self, channel: &Channel) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (name, description, is_joined, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    description = excluded.description,
                    is_joined = excluded.is_joined",
                rusqlite::params![
                    channel.name,
                    channel.description,
                    channel.is_joined,
                    channel.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_channel(&self, name: &str) -> Result<Option<Channel>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, description, is_joined, created_at FROM channels WHERE name = ?1",
                [name],
                channel_from_row,
            )
            .optional()
        })
    }

    pub fn get_channels(&self, joined_only: bool) -> Result<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, is_joined, created_at FROM channels
                 WHERE NOT ?1 OR is_joined = 1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([joined_only], channel_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Store a message. Returns false if a message with the same envelope id
    /// is already stored.
    pub fn save_message(&self, message: &StoredMessage) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages
                    (id, message_id, message_type, sender, recipient, channel, content, timestamp_ms, is_outbound, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    message.id,
                    message.message_id,
                    message.kind.as_str(),
                    message.sender,
                    message.recipient,
                    message.channel,
                    message.content,
                    message.timestamp.timestamp_millis(),
                    message.is_outbound,
                    message.is_read,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// The newest `limit` messages of a channel, oldest first.
    pub fn get_channel_messages(&self, channel: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                "SELECT * FROM (
                    SELECT id, message_id, message_type, sender, recipient, channel, content,
                           timestamp_ms, is_outbound, is_read
                    FROM messages WHERE channel = ?1
                    ORDER BY timestamp_ms DESC, id DESC
                    LIMIT ?2
                 ) ORDER BY timestamp_ms ASC, id ASC",
                rusqlite::params![channel, limit],
            )
        })
    }

    /// The newest `limit` direct messages exchanged with a contact, oldest first.
    pub fn get_contact_messages(&self, contact: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                "SELECT * FROM (
                    SELECT id, message_id, message_type, sender, recipient, channel, content,
                           timestamp_ms, is_outbound, is_read
                    FROM messages
                    WHERE channel IS NULL AND (sender = ?1 OR recipient = ?1)
                    ORDER BY timestamp_ms DESC, id DESC
                    LIMIT ?2
                 ) ORDER BY timestamp_ms ASC, id ASC",
                rusqlite::params![contact, limit],
            )
        })
    }

    pub fn mark_channel_read(&self, channel: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages SET is_read = 1 WHERE channel = ?1 AND is_read = 0",
                [channel],
            )?)
        })
    }

    /// Replace the content of a stored message that still holds
    /// `placeholder`. Returns true if a row changed.
    pub fn replace_placeholder(&self, message_id: &str, placeholder: &str, content: &str) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages SET content = ?3 WHERE message_id = ?1 AND content = ?2",
                rusqlite::params![message_id, placeholder, content],
            )? > 0)
        })
    }

    // -- Channel keys --

    pub fn save_channel_key(&self, channel: &str, key_id: &str, sealed_key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO channel_keys (channel, key_id, sealed_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![channel, key_id, sealed_key, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }

    /// All stored keys for a channel, oldest first.
    pub fn get_channel_keys(&self, channel: &str) -> Result<Vec<ChannelKeyRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel, key_id, sealed_key, created_at FROM channel_keys
                 WHERE channel = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([channel], |row| {
                    Ok(ChannelKeyRow {
                        channel: row.get(0)?,
                        key_id: row.get(1)?,
                        sealed_key: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_messages(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                message_id: row.get(1)?,
                message_type: row.get(2)?,
                sender: row.get(3)?,
                recipient: row.get(4)?,
                channel: row.get(5)?,
                content: row.get(6)?,
                timestamp_ms: row.get(7)?,
                is_outbound: row.get(8)?,
                is_read: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(into_stored_message).collect()
}

fn into_stored_message(row: MessageRow) -> Result<StoredMessage> {
    let kind: MessageType = row
        .message_type
        .parse()
        .map_err(|e| anyhow!("message {}: {}", row.message_id, e))?;
    Ok(StoredMessage {
        id: row.id,
        message_id: row.message_id,
        kind,
        sender: row.sender,
        recipient: row.recipient,
        channel: row.channel,
        content: row.content,
        timestamp: DateTime::from_timestamp_millis(row.timestamp_ms).unwrap_or_default(),
        is_outbound: row.is_outbound,
        is_read: row.is_read,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        username: row.get(0)?,
        display_name: row.get(1)?,
        endpoint: row.get(2)?,
        public_key: row.get(3)?,
        notes: row.get(4)?,
        is_blocked: row.get(5)?,
        last_seen: row.get::<_, Option<String>>(6)?.map(parse_ts),
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        name: row.get(0)?,
        description: row.get(1)?,
        is_joined: row.get(2)?,
        created_at: parse_ts(row.get::<_, String>(3)?),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn message(id: i64, channel: &str, sender: &str, offset_ms: i64) -> StoredMessage {
        StoredMessage {
            id,
            message_id: Uuid::new_v4().to_string(),
            kind: MessageType::Chat,
            sender: sender.into(),
            recipient: None,
            channel: Some(channel.into()),
            content: format!("message {}", id),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000 + offset_ms).unwrap(),
            is_outbound: false,
            is_read: false,
        }
    }

    #[test]
    fn channel_history_is_chronological_and_bounded() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..30 {
            db.save_message(&message(i, "general", "alice", i * 10)).unwrap();
        }
        db.save_message(&message(100, "random", "bob", 0)).unwrap();

        let page = db.get_channel_messages("general", 20).unwrap();
        assert_eq!(page.len(), 20);
        // Newest 20, oldest first
        assert_eq!(page.first().unwrap().id, 10);
        assert_eq!(page.last().unwrap().id, 29);
        assert!(page.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn placeholders_are_replaced_once() {
        let db = Database::open_in_memory().unwrap();
        let mut locked = message(1, "general", "alice", 0);
        locked.content = "[locked]".into();
        db.save_message(&locked).unwrap();

        assert!(db.replace_placeholder(&locked.message_id, "[locked]", "hello").unwrap());
        assert!(!db.replace_placeholder(&locked.message_id, "[locked]", "other").unwrap());
        assert_eq!(db.get_channel_messages("general", 10).unwrap()[0].content, "hello");
    }

    #[test]
    fn duplicate_envelopes_are_ignored() {
        let db = Database::open_in_memory().unwrap();
        let first = message(1, "general", "alice", 0);
        let mut again = first.clone();
        again.id = 2;

        assert!(db.save_message(&first).unwrap());
        assert!(!db.save_message(&again).unwrap());
        assert_eq!(db.get_channel_messages("general", 10).unwrap().len(), 1);
    }

    #[test]
    fn contact_messages_cover_both_directions() {
        let db = Database::open_in_memory().unwrap();
        let mut inbound = message(1, "x", "bob", 0);
        inbound.channel = None;
        inbound.recipient = Some("alice".into());
        inbound.kind = MessageType::Direct;
        let mut outbound = message(2, "x", "alice", 5);
        outbound.channel = None;
        outbound.recipient = Some("bob".into());
        outbound.kind = MessageType::Direct;

        db.save_message(&inbound).unwrap();
        db.save_message(&outbound).unwrap();
        db.save_message(&message(3, "general", "bob", 10)).unwrap();

        let thread = db.get_contact_messages("bob", 10).unwrap();
        assert_eq!(thread.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn contacts_and_profile_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_profile().unwrap().is_none());

        db.save_profile(&Profile {
            username: "alice".into(),
            display_name: "Alice".into(),
            public_key: Some("cHVi".into()),
            status: "online".into(),
            created_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(db.get_profile().unwrap().unwrap().username, "alice");

        let mut blocked = Contact::new("mallory", "broker:9092");
        blocked.is_blocked = true;
        db.save_contact(&Contact::new("bob", "broker:9092").with_public_key("a2V5"))
            .unwrap();
        db.save_contact(&blocked).unwrap();

        let bob = db.get_contact("bob").unwrap().unwrap();
        assert_eq!(bob.public_key.as_deref(), Some("a2V5"));
        assert_eq!(db.get_contacts(false).unwrap().len(), 1);
        assert_eq!(db.get_contacts(true).unwrap().len(), 2);
        assert!(db.delete_contact("bob").unwrap());
        assert!(db.get_contact("bob").unwrap().is_none());
    }

    #[test]
    fn channels_filter_on_joined() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.save_channel(&Channel {
            name: "general".into(),
            description: None,
            is_joined: true,
            created_at: now,
        })
        .unwrap();
        db.save_channel(&Channel {
            name: "old".into(),
            description: Some("left".into()),
            is_joined: false,
            created_at: now - Duration::days(1),
        })
        .unwrap();

        assert_eq!(db.get_channels(true).unwrap().len(), 1);
        assert_eq!(db.get_channels(false).unwrap().len(), 2);
        assert!(!db.get_channel("old").unwrap().unwrap().is_joined);
    }

    #[test]
    fn channel_keys_keep_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        db.save_channel_key("general", "k1", "sealed-1").unwrap();
        db.save_channel_key("general", "k2", "sealed-2").unwrap();
        db.save_channel_key("random", "k3", "sealed-3").unwrap();

        let keys = db.get_channel_keys("general").unwrap();
        assert_eq!(
            keys.iter().map(|k| k.key_id.as_str()).collect::<Vec<_>>(),
            vec!["k1", "k2"]
        );
    }
}
