//! Per-channel sync cursor and bootstrap bookkeeping.

use rusqlite::params;
use tandem_shared::{time, ChannelId, UserId};
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::{SyncCursor, SyncState};

impl Database {
    /// Fetch the sync state for one `(owner, channel)`.  `None` means no
    /// bootstrap has ever been attempted.
    pub fn get_sync_state(&self, owner: &UserId, channel: &ChannelId) -> Result<Option<SyncState>> {
        let result = self.conn().query_row(
            "SELECT owner, channel, last_ts_ms, last_message_id, bootstrap_incomplete,
                    gap_detected, schema_version, app_version, updated_at_ms
             FROM sync_state
             WHERE owner = ?1 AND channel = ?2",
            params![owner.as_str(), channel.as_str()],
            row_to_sync_state,
        );
        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record that a bootstrap run has begun.
    ///
    /// Sets `bootstrap_incomplete` so an interrupted run is visible to the
    /// next session.  An existing cursor is kept; it still bounds the
    /// backfill paging.
    pub fn mark_bootstrap_started(
        &self,
        owner: &UserId,
        channel: &ChannelId,
        schema_version: u32,
        app_version: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_state
             (owner, channel, last_ts_ms, last_message_id, bootstrap_incomplete,
              gap_detected, schema_version, app_version, updated_at_ms)
             VALUES (?1, ?2, NULL, NULL, 1, 0, ?3, ?4, ?5)
             ON CONFLICT(owner, channel) DO UPDATE SET
                 bootstrap_incomplete = 1,
                 schema_version = excluded.schema_version,
                 app_version = excluded.app_version,
                 updated_at_ms = excluded.updated_at_ms",
            params![
                owner.as_str(),
                channel.as_str(),
                schema_version,
                app_version,
                time::now_ms(),
            ],
        )?;
        Ok(())
    }

    /// Record a finished bootstrap: store the new cursor (if the channel
    /// had any messages) and clear both recovery flags.
    pub fn mark_bootstrap_completed(
        &self,
        owner: &UserId,
        channel: &ChannelId,
        cursor: Option<&SyncCursor>,
        schema_version: u32,
        app_version: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_state
             (owner, channel, last_ts_ms, last_message_id, bootstrap_incomplete,
              gap_detected, schema_version, app_version, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?7)
             ON CONFLICT(owner, channel) DO UPDATE SET
                 last_ts_ms = excluded.last_ts_ms,
                 last_message_id = excluded.last_message_id,
                 bootstrap_incomplete = 0,
                 gap_detected = 0,
                 schema_version = excluded.schema_version,
                 app_version = excluded.app_version,
                 updated_at_ms = excluded.updated_at_ms",
            params![
                owner.as_str(),
                channel.as_str(),
                cursor.map(|c| c.sent_at_ms),
                cursor.map(|c| c.message_id.to_string()),
                schema_version,
                app_version,
                time::now_ms(),
            ],
        )?;
        Ok(())
    }

    /// Move the cursor forward to `cursor` if it is ahead of the stored
    /// position.  Returns `false` when the stored cursor already points at
    /// or past the given position, or when no state row exists yet.
    pub fn advance_cursor(
        &self,
        owner: &UserId,
        channel: &ChannelId,
        cursor: &SyncCursor,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE sync_state
             SET last_ts_ms = ?3, last_message_id = ?4, updated_at_ms = ?5
             WHERE owner = ?1 AND channel = ?2
               AND (last_ts_ms IS NULL
                    OR last_ts_ms < ?3
                    OR (last_ts_ms = ?3 AND last_message_id < ?4))",
            params![
                owner.as_str(),
                channel.as_str(),
                cursor.sent_at_ms,
                cursor.message_id.to_string(),
                time::now_ms(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Flag a continuity gap so the next session runs a full bootstrap.
    ///
    /// Returns `false` when no state row exists; a missing row already
    /// forces a bootstrap, so there is nothing to flag.
    pub fn mark_gap_detected(&self, owner: &UserId, channel: &ChannelId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE sync_state SET gap_detected = 1, updated_at_ms = ?3
             WHERE owner = ?1 AND channel = ?2",
            params![owner.as_str(), channel.as_str(), time::now_ms()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_sync_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    let owner: String = row.get(0)?;
    let channel: String = row.get(1)?;
    let last_ts_ms: Option<i64> = row.get(2)?;
    let last_id_str: Option<String> = row.get(3)?;
    let bootstrap_incomplete: bool = row.get(4)?;
    let gap_detected: bool = row.get(5)?;
    let schema_version: u32 = row.get(6)?;
    let app_version: String = row.get(7)?;
    let updated_at_ms: i64 = row.get(8)?;

    let last_message_id = match last_id_str {
        Some(s) => Some(Uuid::parse_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(SyncState {
        owner: UserId::new(owner),
        channel: ChannelId(channel),
        last_ts_ms,
        last_message_id,
        bootstrap_incomplete,
        gap_detected,
        schema_version,
        app_version,
        updated_at_ms,
    })
}
