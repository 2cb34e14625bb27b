//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to higher layers without a mapping step.

use serde::{Deserialize, Serialize};
use tandem_shared::{ChannelId, PayloadKind, UserId};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Which party authored a stored message, from the owner's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outbound" => Some(Direction::Outbound),
            "inbound" => Some(Direction::Inbound),
            _ => None,
        }
    }
}

/// Upload progress of an outbound message.  Inbound rows carry no state.
///
/// `Failed` rows remain eligible for the retry drain; a message leaves the
/// queue only by reaching `Uploaded` or by channel deletion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Uploaded,
    Failed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Uploaded => "uploaded",
            UploadState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadState::Pending),
            "uploaded" => Some(UploadState::Uploaded),
            "failed" => Some(UploadState::Failed),
            _ => None,
        }
    }
}

/// A single chat message as persisted locally.  Content is plaintext at
/// this boundary; the ciphertext exists only in transit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    /// Globally unique, caller-generated message identifier.
    pub id: Uuid,
    /// The local account this row belongs to.
    pub owner: UserId,
    /// The two-party channel the message lives in.
    pub channel: ChannelId,
    /// Author of the message.
    pub sender: UserId,
    /// Addressee of the message.
    pub recipient: UserId,
    /// Sender-assigned timestamp in epoch milliseconds.  Part of the
    /// total order `(sent_at_ms, id)`.
    pub sent_at_ms: i64,
    /// Payload variant (text, emoji, gif).
    pub kind: PayloadKind,
    /// Plaintext payload value.
    pub value: String,
    /// Display hint for ephemeral rendering; not a security boundary.
    pub is_secret: bool,
    /// Who authored it, relative to the owner.
    pub direction: Direction,
    /// `Some` for outbound rows, `None` for inbound.
    pub upload_state: Option<UploadState>,
    /// When the row was written locally, epoch milliseconds.
    pub created_at_ms: i64,
}

impl StoredMessage {
    /// The paging cursor position of this message.
    pub fn cursor(&self) -> SyncCursor {
        SyncCursor {
            sent_at_ms: self.sent_at_ms,
            message_id: self.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery receipt
// ---------------------------------------------------------------------------

/// Delivery (and optionally read) acknowledgement for one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: ChannelId,
    pub message_id: Uuid,
    pub sender: UserId,
    pub recipient: UserId,
    pub delivered_at_ms: i64,
    pub read_at_ms: Option<i64>,
    pub updated_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// At most one emoji per `(channel, message_id, reactor)`; setting a new
/// emoji replaces the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub channel: ChannelId,
    pub message_id: Uuid,
    pub reactor: UserId,
    pub emoji: String,
    pub updated_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Exclusive lower bound into the `(sent_at_ms, id)` total order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCursor {
    pub sent_at_ms: i64,
    pub message_id: Uuid,
}

/// Per-`(owner, channel)` synchronization bookkeeping.
///
/// Created on the first bootstrap attempt, updated on every successful
/// catch-up, deleted only with the channel itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub owner: UserId,
    pub channel: ChannelId,
    pub last_ts_ms: Option<i64>,
    pub last_message_id: Option<Uuid>,
    pub bootstrap_incomplete: bool,
    pub gap_detected: bool,
    pub schema_version: u32,
    pub app_version: String,
    pub updated_at_ms: i64,
}

impl SyncState {
    /// The stored cursor, if both halves are present.
    pub fn cursor(&self) -> Option<SyncCursor> {
        match (self.last_ts_ms, self.last_message_id) {
            (Some(sent_at_ms), Some(message_id)) => Some(SyncCursor {
                sent_at_ms,
                message_id,
            }),
            _ => None,
        }
    }
}
