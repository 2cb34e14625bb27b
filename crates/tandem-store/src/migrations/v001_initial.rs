//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `messages`, `receipts`, `reactions`,
//! and `sync_state`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
--
-- One row per message per channel.  The (channel, message_id)
-- primary key makes inserts idempotent across local, backfill, and
-- live-stream sources.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    owner         TEXT NOT NULL,               -- local account id
    channel       TEXT NOT NULL,               -- derived pair channel id
    message_id    TEXT NOT NULL,               -- UUID v4
    sender        TEXT NOT NULL,
    recipient     TEXT NOT NULL,
    sent_at_ms    INTEGER NOT NULL,            -- sender-assigned epoch ms
    payload_type  TEXT NOT NULL,               -- text | emoji | gif
    payload_value TEXT NOT NULL,               -- plaintext
    is_secret     INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    direction     TEXT NOT NULL,               -- outbound | inbound
    upload_state  TEXT,                        -- pending | uploaded | failed; NULL for inbound
    created_at_ms INTEGER NOT NULL,

    PRIMARY KEY (channel, message_id)
);

-- Paging and cursor comparisons walk this index.
CREATE INDEX IF NOT EXISTS idx_messages_channel_order
    ON messages(channel, sent_at_ms, message_id);

-- The retry drain scans un-uploaded rows oldest first.
CREATE INDEX IF NOT EXISTS idx_messages_upload_state
    ON messages(upload_state, created_at_ms);

-- ----------------------------------------------------------------
-- Delivery receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS receipts (
    channel         TEXT NOT NULL,
    message_id      TEXT NOT NULL,             -- UUID v4
    sender          TEXT NOT NULL,
    recipient       TEXT NOT NULL,
    delivered_at_ms INTEGER NOT NULL,
    read_at_ms      INTEGER,                   -- NULL until read
    updated_at_ms   INTEGER NOT NULL,

    PRIMARY KEY (channel, message_id)
);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    channel       TEXT NOT NULL,
    message_id    TEXT NOT NULL,               -- UUID v4
    reactor       TEXT NOT NULL,               -- user id
    emoji         TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL,

    PRIMARY KEY (channel, message_id, reactor)
);

-- ----------------------------------------------------------------
-- Sync state (per-channel cursor and bootstrap flags)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    owner                TEXT NOT NULL,
    channel              TEXT NOT NULL,
    last_ts_ms           INTEGER,              -- NULL until first catch-up
    last_message_id      TEXT,                 -- NULL until first catch-up
    bootstrap_incomplete INTEGER NOT NULL DEFAULT 0,
    gap_detected         INTEGER NOT NULL DEFAULT 0,
    schema_version       INTEGER NOT NULL,
    app_version          TEXT NOT NULL,
    updated_at_ms        INTEGER NOT NULL,

    PRIMARY KEY (owner, channel)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
