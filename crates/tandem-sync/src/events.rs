use std::time::Duration;

use tandem_shared::ChannelId;
use tandem_store::StoredMessage;
use uuid::Uuid;

use crate::bootstrap::BootstrapReason;
use crate::error::ErrorCategory;

/// Where a newly visible message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// Sent from this device during the current session.
    LocalSend,
    /// Merged from the live cloud feed or an on-demand history load.
    CloudStream,
}

/// Notifications pushed to the session owner over the event channel.
///
/// Bootstrap backfills deliberately do not emit one `MessageAdded` per
/// row; `BootstrapCompleted` tells the owner to re-read the timeline
/// snapshot instead.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SessionStarted {
        channel: ChannelId,
        bootstrap: Option<BootstrapReason>,
    },
    BootstrapCompleted {
        channel: ChannelId,
        inserted: usize,
    },
    MessageAdded {
        message: StoredMessage,
        source: MessageSource,
    },
    MessageUploaded {
        channel: ChannelId,
        message_id: Uuid,
    },
    RetryScheduled {
        channel: ChannelId,
        delay: Duration,
        consecutive_failures: u32,
    },
    /// Receipt or reaction state changed for a message already on the timeline.
    MetadataChanged {
        channel: ChannelId,
        message_id: Uuid,
    },
    /// The live feed could not be resumed without loss; the next session
    /// will re-bootstrap.
    GapDetected {
        channel: ChannelId,
    },
    ChannelDeleted {
        channel: ChannelId,
    },
    ErrorSurfaced {
        category: ErrorCategory,
        message: String,
    },
}
