use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profile (
            username        TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            public_key      TEXT,
            status          TEXT NOT NULL DEFAULT 'online',
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contacts (
            username        TEXT PRIMARY KEY,
            display_name    TEXT,
            endpoint        TEXT NOT NULL,
            public_key      TEXT,
            notes           TEXT,
            is_blocked      INTEGER NOT NULL DEFAULT 0,
            last_seen       TEXT
        );

        CREATE TABLE IF NOT EXISTS channels (
            name            TEXT PRIMARY KEY,
            description     TEXT,
            is_joined       INTEGER NOT NULL DEFAULT 1,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY,
            message_id      TEXT NOT NULL UNIQUE,
            message_type    TEXT NOT NULL,
            sender          TEXT NOT NULL,
            recipient       TEXT,
            channel         TEXT,
            content         TEXT NOT NULL,
            timestamp_ms    INTEGER NOT NULL,
            is_outbound     INTEGER NOT NULL DEFAULT 0,
            is_read         INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel, timestamp_ms);

        CREATE INDEX IF NOT EXISTS idx_messages_contact
            ON messages(sender, recipient, timestamp_ms);

        CREATE TABLE IF NOT EXISTS channel_keys (
            channel         TEXT NOT NULL,
            key_id          TEXT NOT NULL,
            sealed_key      TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            PRIMARY KEY (channel, key_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
