//! Cloud relay seam.
//!
//! [`CloudTransport`] is the only surface the engine talks to the network
//! through; [`MemoryTransport`] implements it over a shared in-process log
//! for tests and the demo binary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tandem_shared::{ChannelId, CloudEnvelope};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by relay")]
    RateLimited { retry_after_ms: Option<u64> },

    /// The relay understood the request and refused it. Retrying the same
    /// payload will not help.
    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("subscription closed")]
    Closed,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }

    /// Server-suggested minimum wait before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            TransportError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Paging bound in the relay's native units. Envelope timestamps are
/// second-granular, so the id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EnvelopeCursor {
    pub sent_at_secs: i64,
    pub id: Uuid,
}

impl EnvelopeCursor {
    pub fn for_envelope(envelope: &CloudEnvelope) -> Self {
        Self {
            sent_at_secs: envelope.sent_at_secs,
            id: envelope.id,
        }
    }
}

/// One delivery from a live subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionBatch {
    pub envelopes: Vec<CloudEnvelope>,
    /// `false` when the relay could not replay all the way back to the
    /// requested cursor. The engine flags a gap so the next session
    /// re-bootstraps instead of trusting a timeline with a hole in it.
    pub contiguous: bool,
}

/// Live envelope feed for one channel. Dropping it cancels the feed.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<SubscriptionBatch>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<SubscriptionBatch>) -> Self {
        Self { receiver }
    }

    /// The next batch, or `None` once the feed is closed.
    pub async fn next_batch(&mut self) -> Option<SubscriptionBatch> {
        self.receiver.recv().await
    }
}

/// Everything the engine needs from the cloud relay.
///
/// All fetch methods return envelopes in ascending `(sent_at_secs, id)`
/// order. The relay stores only opaque ciphertext; nothing here implies it
/// can read message bodies.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn send_envelope(
        &self,
        channel: &ChannelId,
        envelope: &CloudEnvelope,
    ) -> Result<(), TransportError>;

    /// The newest `limit` envelopes on the channel.
    async fn fetch_recent(
        &self,
        channel: &ChannelId,
        limit: u32,
    ) -> Result<Vec<CloudEnvelope>, TransportError>;

    /// Up to `limit` envelopes strictly older than `before`.
    /// `before = None` means "from the newest".
    async fn fetch_older(
        &self,
        channel: &ChannelId,
        before: Option<EnvelopeCursor>,
        limit: u32,
    ) -> Result<Vec<CloudEnvelope>, TransportError>;

    /// Open a live feed, replaying envelopes after `from` before switching
    /// to real-time delivery. `from = None` subscribes from now.
    async fn subscribe(
        &self,
        channel: &ChannelId,
        from: Option<EnvelopeCursor>,
    ) -> Result<Subscription, TransportError>;

    /// Confirm to the relay that one message reached this device.
    async fn ack(&self, channel: &ChannelId, message_id: Uuid) -> Result<(), TransportError>;
}

// ---- In-memory implementation ----

#[derive(Default)]
struct ChannelLog {
    /// Ascending by `(sent_at_secs, id)`.
    envelopes: Vec<CloudEnvelope>,
    subscribers: Vec<mpsc::UnboundedSender<SubscriptionBatch>>,
    acked: HashSet<Uuid>,
    /// Envelopes older than this were expired by the relay; subscriptions
    /// asking to resume from before it are non-contiguous.
    history_floor_secs: i64,
}

#[derive(Default)]
struct MemoryInner {
    channels: HashMap<ChannelId, ChannelLog>,
    offline: bool,
    fail_next_sends: u32,
}

/// Relay double backed by a shared in-process log. Clones share state, so
/// two parties handed clones of the same transport see each other's
/// traffic.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload relay history, e.g. messages sent before this device existed.
    pub async fn seed(&self, channel: &ChannelId, envelopes: Vec<CloudEnvelope>) {
        let mut inner = self.inner.lock().await;
        let log = inner.channels.entry(channel.clone()).or_default();
        for envelope in envelopes {
            if !log.envelopes.iter().any(|e| e.id == envelope.id) {
                log.envelopes.push(envelope);
            }
        }
        log.envelopes.sort_by(|a, b| envelope_key(a).cmp(&envelope_key(b)));
    }

    /// Fail the next `n` sends and acks with a retryable timeout.
    pub async fn fail_next_sends(&self, n: u32) {
        self.inner.lock().await.fail_next_sends = n;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    /// Expire relay history strictly older than `secs`.
    pub async fn expire_history_before(&self, channel: &ChannelId, secs: i64) {
        let mut inner = self.inner.lock().await;
        let log = inner.channels.entry(channel.clone()).or_default();
        log.envelopes.retain(|e| e.sent_at_secs >= secs);
        log.history_floor_secs = secs;
    }

    pub async fn stored(&self, channel: &ChannelId) -> Vec<CloudEnvelope> {
        let inner = self.inner.lock().await;
        inner
            .channels
            .get(channel)
            .map(|log| log.envelopes.clone())
            .unwrap_or_default()
    }

    pub async fn acked(&self, channel: &ChannelId) -> HashSet<Uuid> {
        let inner = self.inner.lock().await;
        inner
            .channels
            .get(channel)
            .map(|log| log.acked.clone())
            .unwrap_or_default()
    }
}

fn envelope_key(envelope: &CloudEnvelope) -> (i64, Uuid) {
    (envelope.sent_at_secs, envelope.id)
}

/// Ascending tail of `envelopes`, at most `limit` long.
fn newest_ascending(mut envelopes: Vec<CloudEnvelope>, limit: u32) -> Vec<CloudEnvelope> {
    let limit = limit as usize;
    if envelopes.len() > limit {
        envelopes.split_off(envelopes.len() - limit)
    } else {
        envelopes
    }
}

#[async_trait]
impl CloudTransport for MemoryTransport {
    async fn send_envelope(
        &self,
        channel: &ChannelId,
        envelope: &CloudEnvelope,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.offline {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }
        if inner.fail_next_sends > 0 {
            inner.fail_next_sends -= 1;
            return Err(TransportError::Timeout);
        }
        let log = inner.channels.entry(channel.clone()).or_default();
        if log.envelopes.iter().any(|e| e.id == envelope.id) {
            // The relay deduplicates by id, so upload retries are harmless.
            return Ok(());
        }
        log.envelopes.push(envelope.clone());
        log.envelopes.sort_by(|a, b| envelope_key(a).cmp(&envelope_key(b)));
        log.subscribers.retain(|tx| {
            tx.send(SubscriptionBatch {
                envelopes: vec![envelope.clone()],
                contiguous: true,
            })
            .is_ok()
        });
        Ok(())
    }

    async fn fetch_recent(
        &self,
        channel: &ChannelId,
        limit: u32,
    ) -> Result<Vec<CloudEnvelope>, TransportError> {
        let inner = self.inner.lock().await;
        if inner.offline {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }
        let envelopes = inner
            .channels
            .get(channel)
            .map(|log| log.envelopes.clone())
            .unwrap_or_default();
        Ok(newest_ascending(envelopes, limit))
    }

    async fn fetch_older(
        &self,
        channel: &ChannelId,
        before: Option<EnvelopeCursor>,
        limit: u32,
    ) -> Result<Vec<CloudEnvelope>, TransportError> {
        let inner = self.inner.lock().await;
        if inner.offline {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }
        let envelopes: Vec<CloudEnvelope> = inner
            .channels
            .get(channel)
            .map(|log| {
                log.envelopes
                    .iter()
                    .filter(|e| match before {
                        Some(cursor) => (e.sent_at_secs, e.id) < (cursor.sent_at_secs, cursor.id),
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(newest_ascending(envelopes, limit))
    }

    async fn subscribe(
        &self,
        channel: &ChannelId,
        from: Option<EnvelopeCursor>,
    ) -> Result<Subscription, TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.offline {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }
        let log = inner.channels.entry(channel.clone()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(cursor) = from {
            let replay: Vec<CloudEnvelope> = log
                .envelopes
                .iter()
                .filter(|e| (e.sent_at_secs, e.id) > (cursor.sent_at_secs, cursor.id))
                .cloned()
                .collect();
            let contiguous = cursor.sent_at_secs >= log.history_floor_secs;
            if !replay.is_empty() || !contiguous {
                let _ = tx.send(SubscriptionBatch {
                    envelopes: replay,
                    contiguous,
                });
            }
        }
        log.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn ack(&self, channel: &ChannelId, message_id: Uuid) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.offline {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }
        if inner.fail_next_sends > 0 {
            inner.fail_next_sends -= 1;
            return Err(TransportError::Timeout);
        }
        let log = inner.channels.entry(channel.clone()).or_default();
        log.acked.insert(message_id);
        Ok(())
    }
}
