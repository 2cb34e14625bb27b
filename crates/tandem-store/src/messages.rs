//! Message persistence: idempotent inserts, ascending-order paging, and
//! the durable outbound upload queue.

use rusqlite::{params, Connection};
use tandem_shared::{ChannelId, PayloadKind, UserId};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Direction, StoredMessage, SyncCursor, UploadState};

const INSERT_MESSAGE_SQL: &str = "INSERT OR IGNORE INTO messages
     (owner, channel, message_id, sender, recipient, sent_at_ms,
      payload_type, payload_value, is_secret, direction, upload_state, created_at_ms)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

impl Database {
    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert a message unless a row with the same `(channel, message_id)`
    /// already exists.  Returns `true` when a new row was written.
    ///
    /// This is the merge point for all three message sources (local send,
    /// cloud backfill, live stream); replays collapse here.
    pub fn insert_message_if_absent(&self, message: &StoredMessage) -> Result<bool> {
        let affected = insert_message(self.conn(), message)?;
        Ok(affected > 0)
    }

    /// Insert a batch of messages in one transaction, skipping rows that
    /// already exist.  Returns the number of newly written rows.
    ///
    /// All-or-none on crash: either the whole page lands or none of it,
    /// so a bootstrap interrupted mid-page never leaves a partial page.
    pub fn insert_messages_if_absent(&mut self, batch: &[StoredMessage]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut inserted = 0;
        for message in batch {
            inserted += insert_message(&tx, message)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message.
    pub fn get_message_by_id(&self, channel: &ChannelId, id: Uuid) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                "SELECT owner, channel, message_id, sender, recipient, sent_at_ms,
                        payload_type, payload_value, is_secret, direction, upload_state, created_at_ms
                 FROM messages
                 WHERE channel = ?1 AND message_id = ?2",
                params![channel.as_str(), id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The newest `limit` messages of a channel, ascending by
    /// `(sent_at_ms, message_id)`.
    pub fn recent_messages(&self, channel: &ChannelId, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT owner, channel, message_id, sender, recipient, sent_at_ms,
                    payload_type, payload_value, is_secret, direction, upload_state, created_at_ms
             FROM messages
             WHERE channel = ?1
             ORDER BY sent_at_ms DESC, message_id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![channel.as_str(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Up to `limit` messages strictly older than `before`, ascending.
    ///
    /// "Older" follows the `(sent_at_ms, message_id)` total order, so ties
    /// on the timestamp page deterministically.
    pub fn messages_before(
        &self,
        channel: &ChannelId,
        before: &SyncCursor,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT owner, channel, message_id, sender, recipient, sent_at_ms,
                    payload_type, payload_value, is_secret, direction, upload_state, created_at_ms
             FROM messages
             WHERE channel = ?1
               AND (sent_at_ms < ?2 OR (sent_at_ms = ?2 AND message_id < ?3))
             ORDER BY sent_at_ms DESC, message_id DESC
             LIMIT ?4",
        )?;

        let rows = stmt.query_map(
            params![
                channel.as_str(),
                before.sent_at_ms,
                before.message_id.to_string(),
                limit
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// The newest message of a channel, if any.
    pub fn latest_message(&self, channel: &ChannelId) -> Result<Option<StoredMessage>> {
        let result = self.conn().query_row(
            "SELECT owner, channel, message_id, sender, recipient, sent_at_ms,
                    payload_type, payload_value, is_secret, direction, upload_state, created_at_ms
             FROM messages
             WHERE channel = ?1
             ORDER BY sent_at_ms DESC, message_id DESC
             LIMIT 1",
            params![channel.as_str()],
            row_to_message,
        );
        match result {
            Ok(message) => Ok(Some(message)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Total number of stored messages in a channel.
    pub fn message_count(&self, channel: &ChannelId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE channel = ?1",
            params![channel.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Upload queue
    // ------------------------------------------------------------------

    /// Outbound rows still awaiting upload, oldest first.
    ///
    /// Includes `failed` rows: a failure parks the message for the backoff
    /// drain, it never removes it from the queue.
    pub fn pending_uploads(&self, channel: &ChannelId, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT owner, channel, message_id, sender, recipient, sent_at_ms,
                    payload_type, payload_value, is_secret, direction, upload_state, created_at_ms
             FROM messages
             WHERE channel = ?1 AND upload_state IN ('pending', 'failed')
             ORDER BY created_at_ms ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![channel.as_str(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Record a confirmed upload.  Inbound rows are never touched.
    pub fn mark_uploaded(&self, channel: &ChannelId, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET upload_state = 'uploaded'
             WHERE channel = ?1 AND message_id = ?2 AND upload_state IS NOT NULL",
            params![channel.as_str(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Record a failed upload attempt.  A row already confirmed as
    /// uploaded stays uploaded even if a stale failure lands late.
    pub fn mark_upload_failed(&self, channel: &ChannelId, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET upload_state = 'failed'
             WHERE channel = ?1 AND message_id = ?2
               AND upload_state IN ('pending', 'failed')",
            params![channel.as_str(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Wipe every trace of a channel (messages, receipts, reactions,
    /// sync state) in one transaction.  Used on unpairing.
    pub fn delete_channel(&mut self, channel: &ChannelId) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE channel = ?1",
            params![channel.as_str()],
        )?;
        tx.execute(
            "DELETE FROM receipts WHERE channel = ?1",
            params![channel.as_str()],
        )?;
        tx.execute(
            "DELETE FROM reactions WHERE channel = ?1",
            params![channel.as_str()],
        )?;
        tx.execute(
            "DELETE FROM sync_state WHERE channel = ?1",
            params![channel.as_str()],
        )?;
        tx.commit()?;

        tracing::info!(channel = %channel, "deleted all channel data");
        Ok(())
    }
}

fn insert_message(conn: &Connection, message: &StoredMessage) -> rusqlite::Result<usize> {
    conn.execute(
        INSERT_MESSAGE_SQL,
        params![
            message.owner.as_str(),
            message.channel.as_str(),
            message.id.to_string(),
            message.sender.as_str(),
            message.recipient.as_str(),
            message.sent_at_ms,
            message.kind.as_str(),
            message.value,
            message.is_secret,
            message.direction.as_str(),
            message.upload_state.map(|s| s.as_str()),
            message.created_at_ms,
        ],
    )
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let owner: String = row.get(0)?;
    let channel: String = row.get(1)?;
    let id_str: String = row.get(2)?;
    let sender: String = row.get(3)?;
    let recipient: String = row.get(4)?;
    let sent_at_ms: i64 = row.get(5)?;
    let kind_str: String = row.get(6)?;
    let value: String = row.get(7)?;
    let is_secret: bool = row.get(8)?;
    let direction_str: String = row.get(9)?;
    let upload_state_str: Option<String> = row.get(10)?;
    let created_at_ms: i64 = row.get(11)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind = PayloadKind::parse(&kind_str).ok_or_else(|| invalid_text(6, &kind_str))?;
    let direction =
        Direction::parse(&direction_str).ok_or_else(|| invalid_text(9, &direction_str))?;
    let upload_state = match upload_state_str {
        Some(s) => Some(UploadState::parse(&s).ok_or_else(|| invalid_text(10, &s))?),
        None => None,
    };

    Ok(StoredMessage {
        id,
        owner: UserId::new(owner),
        channel: ChannelId(channel),
        sender: UserId::new(sender),
        recipient: UserId::new(recipient),
        sent_at_ms,
        kind,
        value,
        is_secret,
        direction,
        upload_state,
        created_at_ms,
    })
}

fn invalid_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized value: {value}").into(),
    )
}
