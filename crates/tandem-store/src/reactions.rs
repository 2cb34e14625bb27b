//! Reaction persistence.
//!
//! Each `(channel, message_id, reactor)` holds at most one emoji; setting
//! a different emoji replaces the old one in place.

use std::collections::HashMap;

use rusqlite::params;
use tandem_shared::{ChannelId, UserId};
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::Reaction;

impl Database {
    /// Set (or replace) a reactor's emoji on a message.
    pub fn set_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.conn().execute(
            "INSERT INTO reactions (channel, message_id, reactor, emoji, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel, message_id, reactor)
             DO UPDATE SET emoji = excluded.emoji, updated_at_ms = excluded.updated_at_ms",
            params![
                reaction.channel.as_str(),
                reaction.message_id.to_string(),
                reaction.reactor.as_str(),
                reaction.emoji,
                reaction.updated_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Remove a reactor's emoji from a message.
    pub fn clear_reaction(
        &self,
        channel: &ChannelId,
        id: Uuid,
        reactor: &UserId,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE channel = ?1 AND message_id = ?2 AND reactor = ?3",
            params![channel.as_str(), id.to_string(), reactor.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// All reactions on a single message, oldest first.
    pub fn get_reactions_for_message(
        &self,
        channel: &ChannelId,
        id: Uuid,
    ) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT channel, message_id, reactor, emoji, updated_at_ms
             FROM reactions
             WHERE channel = ?1 AND message_id = ?2
             ORDER BY updated_at_ms ASC",
        )?;

        let rows = stmt.query_map(params![channel.as_str(), id.to_string()], row_to_reaction)?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }

    /// Fetch reactions for multiple messages at once (batch query).
    pub fn get_reactions_for_messages(
        &self,
        channel: &ChannelId,
        message_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<Reaction>>> {
        let mut map = HashMap::new();
        for id in message_ids {
            let reactions = self.get_reactions_for_message(channel, *id)?;
            if !reactions.is_empty() {
                map.insert(*id, reactions);
            }
        }
        Ok(map)
    }
}

fn row_to_reaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reaction> {
    let channel: String = row.get(0)?;
    let id_str: String = row.get(1)?;
    let reactor: String = row.get(2)?;
    let emoji: String = row.get(3)?;
    let updated_at_ms: i64 = row.get(4)?;

    let message_id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Reaction {
        channel: ChannelId(channel),
        message_id,
        reactor: UserId::new(reactor),
        emoji,
        updated_at_ms,
    })
}
