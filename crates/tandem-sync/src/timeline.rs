//! In-memory merge buffer for one channel.
//!
//! Messages arrive from the local store, local sends, backfill, and the
//! live feed; the timeline keeps them ordered by `(sent_at_ms, id)` and
//! deduplicated by id so each message becomes visible exactly once.

use std::collections::{HashMap, HashSet};

use tandem_shared::UserId;
use tandem_store::{DeliveryReceipt, Reaction, StoredMessage, SyncCursor, UploadState};
use uuid::Uuid;

/// One message plus its projected metadata.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message: StoredMessage,
    pub receipt: Option<DeliveryReceipt>,
    pub reactions: Vec<Reaction>,
}

impl TimelineEntry {
    fn bare(message: StoredMessage) -> Self {
        Self {
            message,
            receipt: None,
            reactions: Vec::new(),
        }
    }
}

pub struct MessageTimeline {
    /// Ascending by `(sent_at_ms, id)`.
    entries: Vec<TimelineEntry>,
    index: HashSet<Uuid>,
    cap: usize,
}

impl MessageTimeline {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            index: HashSet::new(),
            cap: cap.max(1),
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains(&id)
    }

    /// Cursor of the oldest loaded message, the paging bound for history
    /// loads.
    pub fn oldest_cursor(&self) -> Option<SyncCursor> {
        self.entries.first().map(|entry| entry.message.cursor())
    }

    /// Insert a message at its ordered position; returns `false` if the id
    /// is already present. New messages usually sort at the tail, so that
    /// case skips the position search. Evicts from the head once over the
    /// cap.
    pub fn append_if_needed(&mut self, message: StoredMessage) -> bool {
        if !self.index.insert(message.id) {
            return false;
        }
        let key = message_key(&message);
        let at_tail = self
            .entries
            .last()
            .map_or(true, |tail| key >= message_key(&tail.message));
        if at_tail {
            self.entries.push(TimelineEntry::bare(message));
        } else {
            let pos = self
                .entries
                .partition_point(|entry| message_key(&entry.message) < key);
            self.entries.insert(pos, TimelineEntry::bare(message));
        }
        self.evict_over(self.cap);
        true
    }

    /// Splice an ascending batch of strictly-older messages at the head;
    /// returns how many were new. History the user scrolled to stays loaded
    /// even past the cap; callers shrink with [`trim_to`] when the window
    /// should snap back.
    ///
    /// [`trim_to`]: MessageTimeline::trim_to
    pub fn prepend_older(&mut self, batch: Vec<StoredMessage>) -> usize {
        let mut fresh: Vec<TimelineEntry> = Vec::new();
        for message in batch {
            if self.index.insert(message.id) {
                fresh.push(TimelineEntry::bare(message));
            }
        }
        let added = fresh.len();
        self.entries.splice(0..0, fresh);
        added
    }

    /// Keep only the newest `n` entries.
    pub fn trim_to(&mut self, n: usize) {
        self.evict_over(n.max(1));
    }

    fn evict_over(&mut self, bound: usize) {
        if self.entries.len() <= bound {
            return;
        }
        let excess = self.entries.len() - bound;
        for entry in self.entries.drain(0..excess) {
            self.index.remove(&entry.message.id);
        }
    }

    /// Attach fetched receipts and reactions to their entries.
    pub fn hydrate(
        &mut self,
        receipts: &HashMap<Uuid, DeliveryReceipt>,
        reactions: &HashMap<Uuid, Vec<Reaction>>,
    ) {
        for entry in &mut self.entries {
            if let Some(receipt) = receipts.get(&entry.message.id) {
                entry.receipt = Some(receipt.clone());
            }
            if let Some(list) = reactions.get(&entry.message.id) {
                entry.reactions = list.clone();
            }
        }
    }

    pub fn set_receipt(&mut self, receipt: DeliveryReceipt) {
        if let Some(entry) = self.entry_mut(receipt.message_id) {
            entry.receipt = Some(receipt);
        }
    }

    pub fn set_reaction(&mut self, reaction: Reaction) {
        if let Some(entry) = self.entry_mut(reaction.message_id) {
            match entry
                .reactions
                .iter_mut()
                .find(|r| r.reactor == reaction.reactor)
            {
                Some(slot) => *slot = reaction,
                None => entry.reactions.push(reaction),
            }
        }
    }

    pub fn clear_reaction(&mut self, message_id: Uuid, reactor: &UserId) {
        if let Some(entry) = self.entry_mut(message_id) {
            entry.reactions.retain(|r| &r.reactor != reactor);
        }
    }

    pub fn mark_uploaded(&mut self, message_id: Uuid) {
        if let Some(entry) = self.entry_mut(message_id) {
            entry.message.upload_state = Some(UploadState::Uploaded);
        }
    }

    fn entry_mut(&mut self, message_id: Uuid) -> Option<&mut TimelineEntry> {
        // Linear scan; the window is bounded by the cap.
        self.entries
            .iter_mut()
            .find(|entry| entry.message.id == message_id)
    }
}

fn message_key(message: &StoredMessage) -> (i64, Uuid) {
    (message.sent_at_ms, message.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::{ChannelId, PayloadKind};
    use tandem_store::Direction;

    fn message(id: u128, sent_at_ms: i64) -> StoredMessage {
        StoredMessage {
            id: Uuid::from_u128(id),
            owner: UserId::new("alice"),
            channel: ChannelId("cafe".to_string()),
            sender: UserId::new("bob"),
            recipient: UserId::new("alice"),
            sent_at_ms,
            kind: PayloadKind::Text,
            value: format!("m{id}"),
            is_secret: false,
            direction: Direction::Inbound,
            upload_state: None,
            created_at_ms: sent_at_ms,
        }
    }

    fn ids(timeline: &MessageTimeline) -> Vec<u128> {
        timeline
            .entries()
            .iter()
            .map(|e| e.message.id.as_u128())
            .collect()
    }

    #[test]
    fn appends_keep_order_regardless_of_arrival() {
        let mut timeline = MessageTimeline::new(100);
        assert!(timeline.append_if_needed(message(2, 200)));
        assert!(timeline.append_if_needed(message(1, 100)));
        assert!(timeline.append_if_needed(message(3, 300)));
        assert_eq!(ids(&timeline), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_ids_are_rejected_even_with_different_timestamps() {
        let mut timeline = MessageTimeline::new(100);
        assert!(timeline.append_if_needed(message(1, 100)));
        assert!(!timeline.append_if_needed(message(1, 100)));
        assert!(!timeline.append_if_needed(message(1, 999)));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn equal_timestamps_tiebreak_on_id() {
        let mut timeline = MessageTimeline::new(100);
        timeline.append_if_needed(message(2, 100));
        timeline.append_if_needed(message(1, 100));
        assert_eq!(ids(&timeline), vec![1, 2]);
    }

    #[test]
    fn eviction_frees_the_id_for_reappending() {
        let mut timeline = MessageTimeline::new(2);
        timeline.append_if_needed(message(1, 100));
        timeline.append_if_needed(message(2, 200));
        timeline.append_if_needed(message(3, 300));
        assert_eq!(ids(&timeline), vec![2, 3]);
        assert!(!timeline.contains(Uuid::from_u128(1)));
        // Once evicted the row may re-enter the window.
        assert!(timeline.append_if_needed(message(1, 100)));
    }

    #[test]
    fn prepend_dedups_and_may_exceed_the_cap() {
        let mut timeline = MessageTimeline::new(2);
        timeline.append_if_needed(message(3, 300));
        timeline.append_if_needed(message(4, 400));

        let added = timeline.prepend_older(vec![message(1, 100), message(2, 200), message(3, 300)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&timeline), vec![1, 2, 3, 4]);
        assert_eq!(
            timeline.oldest_cursor().map(|c| c.message_id),
            Some(Uuid::from_u128(1))
        );

        timeline.trim_to(2);
        assert_eq!(ids(&timeline), vec![3, 4]);
    }

    #[test]
    fn hydrate_and_single_updates_attach_metadata() {
        let mut timeline = MessageTimeline::new(10);
        timeline.append_if_needed(message(1, 100));
        timeline.append_if_needed(message(2, 200));

        let receipt = DeliveryReceipt {
            channel: ChannelId("cafe".to_string()),
            message_id: Uuid::from_u128(1),
            sender: UserId::new("bob"),
            recipient: UserId::new("alice"),
            delivered_at_ms: 150,
            read_at_ms: None,
            updated_at_ms: 150,
        };
        let reaction = Reaction {
            channel: ChannelId("cafe".to_string()),
            message_id: Uuid::from_u128(2),
            reactor: UserId::new("alice"),
            emoji: "🔥".to_string(),
            updated_at_ms: 250,
        };

        let receipts = HashMap::from([(receipt.message_id, receipt.clone())]);
        let reactions = HashMap::from([(reaction.message_id, vec![reaction.clone()])]);
        timeline.hydrate(&receipts, &reactions);

        assert!(timeline.entries()[0].receipt.is_some());
        assert_eq!(timeline.entries()[1].reactions.len(), 1);

        // A second reaction from the same reactor replaces, not appends.
        let changed = Reaction {
            emoji: "👍".to_string(),
            ..reaction
        };
        timeline.set_reaction(changed);
        assert_eq!(timeline.entries()[1].reactions.len(), 1);
        assert_eq!(timeline.entries()[1].reactions[0].emoji, "👍");

        timeline.clear_reaction(Uuid::from_u128(2), &UserId::new("alice"));
        assert!(timeline.entries()[1].reactions.is_empty());
    }

    #[test]
    fn mark_uploaded_updates_the_entry_in_place() {
        let mut timeline = MessageTimeline::new(10);
        let mut m = message(1, 100);
        m.direction = Direction::Outbound;
        m.upload_state = Some(UploadState::Pending);
        timeline.append_if_needed(m);

        timeline.mark_uploaded(Uuid::from_u128(1));
        assert_eq!(
            timeline.entries()[0].message.upload_state,
            Some(UploadState::Uploaded)
        );
    }
}
