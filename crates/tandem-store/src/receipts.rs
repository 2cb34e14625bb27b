//! Delivery receipt persistence.
//!
//! One receipt per `(channel, message_id)`; upserts replace wholesale, so
//! the newest acknowledgement snapshot always wins.

use std::collections::HashMap;

use rusqlite::params;
use tandem_shared::{ChannelId, UserId};
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::DeliveryReceipt;

impl Database {
    /// Insert or replace a delivery receipt.
    pub fn upsert_receipt(&self, receipt: &DeliveryReceipt) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO receipts
             (channel, message_id, sender, recipient, delivered_at_ms, read_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                receipt.channel.as_str(),
                receipt.message_id.to_string(),
                receipt.sender.as_str(),
                receipt.recipient.as_str(),
                receipt.delivered_at_ms,
                receipt.read_at_ms,
                receipt.updated_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Set the read timestamp on an existing receipt.
    pub fn mark_read(&self, channel: &ChannelId, id: Uuid, read_at_ms: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE receipts SET read_at_ms = ?1, updated_at_ms = ?1
             WHERE channel = ?2 AND message_id = ?3",
            params![read_at_ms, channel.as_str(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Fetch the receipt for a single message, if one exists.
    pub fn get_receipt(&self, channel: &ChannelId, id: Uuid) -> Result<Option<DeliveryReceipt>> {
        let result = self.conn().query_row(
            "SELECT channel, message_id, sender, recipient, delivered_at_ms, read_at_ms, updated_at_ms
             FROM receipts
             WHERE channel = ?1 AND message_id = ?2",
            params![channel.as_str(), id.to_string()],
            row_to_receipt,
        );
        match result {
            Ok(receipt) => Ok(Some(receipt)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch receipts for multiple messages at once (batch query).
    pub fn get_receipts_for_messages(
        &self,
        channel: &ChannelId,
        message_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, DeliveryReceipt>> {
        let mut map = HashMap::new();
        for id in message_ids {
            if let Some(receipt) = self.get_receipt(channel, *id)? {
                map.insert(*id, receipt);
            }
        }
        Ok(map)
    }
}

fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryReceipt> {
    let channel: String = row.get(0)?;
    let id_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let recipient: String = row.get(3)?;
    let delivered_at_ms: i64 = row.get(4)?;
    let read_at_ms: Option<i64> = row.get(5)?;
    let updated_at_ms: i64 = row.get(6)?;

    let message_id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DeliveryReceipt {
        channel: ChannelId(channel),
        message_id,
        sender: UserId::new(sender),
        recipient: UserId::new(recipient),
        delivered_at_ms,
        read_at_ms,
        updated_at_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_and_mark_read_updates() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let channel = ChannelId::for_pair(&UserId::new("a"), &UserId::new("b"));
        let id = Uuid::from_u128(7);

        let receipt = DeliveryReceipt {
            channel: channel.clone(),
            message_id: id,
            sender: UserId::new("a"),
            recipient: UserId::new("b"),
            delivered_at_ms: 1_000,
            read_at_ms: None,
            updated_at_ms: 1_000,
        };
        db.upsert_receipt(&receipt).unwrap();
        db.upsert_receipt(&DeliveryReceipt {
            delivered_at_ms: 1_500,
            updated_at_ms: 1_500,
            ..receipt.clone()
        })
        .unwrap();

        assert!(db.mark_read(&channel, id, 2_000).unwrap());
        let stored = db.get_receipt(&channel, id).unwrap().unwrap();
        assert_eq!(stored.delivered_at_ms, 1_500);
        assert_eq!(stored.read_at_ms, Some(2_000));

        // Unknown message: nothing to mark.
        assert!(!db.mark_read(&channel, Uuid::from_u128(99), 2_000).unwrap());
    }
}
