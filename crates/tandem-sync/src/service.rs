//! Session orchestrator.
//!
//! [`MessageSyncService`] owns the full sync lifecycle for one channel at a
//! time: bootstrap, the live cloud feed, the upload/ack drain loop with
//! backoff, and the in-memory timeline the owner renders from. Sessions are
//! numbered; restarting or stopping bumps the generation and every spawned
//! task and in-flight completion checks it before touching session state.
//! Store writes from a superseded completion are still applied, since they
//! are keyed by channel and remain valid history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tandem_shared::{time, ChannelCipher, ChannelId, CloudEnvelope, MessagePayload, PayloadKind, UserId};
use tandem_store::{
    Database, DeliveryReceipt, Direction, Reaction, StoredMessage, SyncCursor, SyncState,
    UploadState,
};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bootstrap::{self, BootstrapDecision, BootstrapReason};
use crate::config::SyncConfig;
use crate::error::{ErrorCategory, Result, SyncError};
use crate::events::{MessageSource, SyncEvent};
use crate::throttle::ErrorThrottle;
use crate::timeline::{MessageTimeline, TimelineEntry};
use crate::transport::{CloudTransport, EnvelopeCursor};

/// Mutable state of the current session, guarded by one lock.
struct SessionState {
    /// Bumped on every start/stop; stale completions compare against it.
    generation: u64,
    channel: Option<ChannelId>,
    partner: Option<UserId>,
    timeline: MessageTimeline,
    /// Inbound message ids still owed an ack to the relay.
    pending_acks: VecDeque<Uuid>,
    drain_failures: u32,
    run_now: bool,
    armed_deadline: Option<Instant>,
    /// Set after the first undecryptable envelope of a streak; cleared by
    /// the next successful decryption so the log stays readable.
    warned_decrypt: bool,
}

impl SessionState {
    fn new(timeline_cap: usize) -> Self {
        Self {
            generation: 0,
            channel: None,
            partner: None,
            timeline: MessageTimeline::new(timeline_cap),
            pending_acks: VecDeque::new(),
            drain_failures: 0,
            run_now: false,
            armed_deadline: None,
            warned_decrypt: false,
        }
    }

    fn reset_for(&mut self, timeline_cap: usize, channel: Option<ChannelId>, partner: Option<UserId>) {
        self.generation += 1;
        self.channel = channel;
        self.partner = partner;
        self.timeline = MessageTimeline::new(timeline_cap);
        self.pending_acks.clear();
        self.drain_failures = 0;
        self.run_now = false;
        self.armed_deadline = None;
        self.warned_decrypt = false;
    }
}

#[derive(Clone, Copy)]
enum IngestMode {
    /// Bootstrap backfill: persist and dedup into the timeline, no
    /// per-message events.
    Backfill,
    /// Live feed: persist, merge, and announce each fresh message.
    Live,
    /// On-demand history: persist only; the caller splices the rows into
    /// the timeline head itself.
    History,
}

#[derive(Default)]
struct IngestOutcome {
    /// Rows newly written to the local store.
    persisted: usize,
    /// Oldest decoded cursor in the batch, for floor checks while paging.
    oldest_cursor: Option<SyncCursor>,
    /// Every message that decrypted and decoded, in batch order.
    messages: Vec<StoredMessage>,
}

struct ServiceInner {
    config: SyncConfig,
    local: UserId,
    store: Option<Arc<Mutex<Database>>>,
    transport: Arc<dyn CloudTransport>,
    cipher: Mutex<Box<dyn ChannelCipher>>,
    events: mpsc::Sender<SyncEvent>,
    shared: Mutex<SessionState>,
    drain_notify: Notify,
    throttle: ErrorThrottle,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Synchronizes one two-party channel between the local store and the
/// cloud relay.
///
/// Constructed with its collaborators injected, so tests swap the relay
/// for [`crate::transport::MemoryTransport`] and point the store at a
/// temporary path. Dropping the service aborts its background tasks.
pub struct MessageSyncService {
    inner: Arc<ServiceInner>,
}

impl MessageSyncService {
    /// `store = None` runs the session without persistence: messages still
    /// flow, but nothing survives a restart and bootstrap is skipped.
    pub fn new(
        config: SyncConfig,
        local: UserId,
        store: Option<Database>,
        transport: Arc<dyn CloudTransport>,
        cipher: Box<dyn ChannelCipher>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let throttle = ErrorThrottle::new(config.error_throttle_window);
        let timeline_cap = config.timeline_cap;
        let inner = Arc::new(ServiceInner {
            config,
            local,
            store: store.map(|db| Arc::new(Mutex::new(db))),
            transport,
            cipher: Mutex::new(cipher),
            events,
            shared: Mutex::new(SessionState::new(timeline_cap)),
            drain_notify: Notify::new(),
            throttle,
            tasks: std::sync::Mutex::new(Vec::new()),
        });
        (Self { inner }, events_rx)
    }

    /// Open the store at its default platform path. A failed open degrades
    /// to the store-less mode and surfaces one storage error.
    pub fn with_default_store(
        config: SyncConfig,
        local: UserId,
        transport: Arc<dyn CloudTransport>,
        cipher: Box<dyn ChannelCipher>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (store, open_error) = match Database::new() {
            Ok(db) => (Some(db), None),
            Err(err) => {
                warn!(error = %err, "opening the local store failed; continuing without persistence");
                (None, Some(err))
            }
        };
        let (service, events_rx) = Self::new(config, local, store, transport, cipher);
        if let Some(err) = open_error {
            let _ = service.inner.events.try_send(SyncEvent::ErrorSurfaced {
                category: ErrorCategory::Storage,
                message: err.to_string(),
            });
        }
        (service, events_rx)
    }

    /// Begin syncing the channel shared with `partner`.
    ///
    /// Any previous session is cancelled first. The call returns once the
    /// timeline is seeded and any required bootstrap has run; the live feed
    /// and the drain loop continue in the background.
    pub async fn start(&self, partner: UserId) -> Result<ChannelId> {
        let channel = ChannelId::for_pair(&self.inner.local, &partner);
        let generation = {
            let mut session = self.inner.shared.lock().await;
            session.reset_for(
                self.inner.config.timeline_cap,
                Some(channel.clone()),
                Some(partner.clone()),
            );
            session.generation
        };
        self.inner.abort_tasks();
        info!(channel = %channel, partner = %partner.short(), "starting sync session");

        let decision = self.inner.evaluate_bootstrap(&channel).await?;
        let reason = match decision {
            BootstrapDecision::Run(reason) => Some(reason),
            BootstrapDecision::Skip => None,
        };

        self.inner.seed_timeline(generation, &channel).await?;
        self.inner
            .emit(SyncEvent::SessionStarted {
                channel: channel.clone(),
                bootstrap: reason,
            })
            .await;

        if let Some(reason) = reason {
            self.inner
                .run_bootstrap(generation, &channel, &partner, reason)
                .await;
            // Bootstrap rows went straight to the store; reload the window
            // so the timeline reflects them.
            self.inner.seed_timeline(generation, &channel).await?;
        }

        let from = self.inner.resume_cursor(&channel).await;
        self.spawn_subscription(generation, channel.clone(), partner.clone(), from);
        self.spawn_drain(generation, channel.clone());
        self.inner.schedule_drain_now().await;
        Ok(channel)
    }

    /// Cancel the current session, if any. Safe to call repeatedly.
    pub async fn stop(&self) {
        let had_session = {
            let mut session = self.inner.shared.lock().await;
            let had = session.channel.is_some();
            session.reset_for(self.inner.config.timeline_cap, None, None);
            had
        };
        self.inner.abort_tasks();
        if had_session {
            debug!("sync session stopped");
        }
    }

    /// Compose and send a message on the active channel.
    ///
    /// The durable local write is the commit point; the upload happens in
    /// the background and is retried by the drain loop. The returned
    /// message is already on the timeline in the pending-upload state.
    pub async fn send(&self, kind: PayloadKind, value: String, is_secret: bool) -> Result<StoredMessage> {
        let (generation, channel, partner) = self.inner.current_session().await?;
        let sent_at_ms = time::now_ms();
        let message = StoredMessage {
            id: Uuid::new_v4(),
            owner: self.inner.local.clone(),
            channel: channel.clone(),
            sender: self.inner.local.clone(),
            recipient: partner,
            sent_at_ms,
            kind,
            value,
            is_secret,
            direction: Direction::Outbound,
            upload_state: Some(UploadState::Pending),
            created_at_ms: sent_at_ms,
        };

        if let Some(store) = &self.inner.store {
            store.lock().await.insert_message_if_absent(&message)?;
        }

        {
            let mut session = self.inner.shared.lock().await;
            if session.generation == generation {
                session.timeline.append_if_needed(message.clone());
            }
        }
        self.inner
            .emit(SyncEvent::MessageAdded {
                message: message.clone(),
                source: MessageSource::LocalSend,
            })
            .await;
        self.inner.schedule_drain_now().await;
        Ok(message)
    }

    /// Extend the timeline downward with up to `limit` older messages,
    /// reading the local store first and falling back to the cloud when
    /// local history runs out. Returns how many entries were added.
    pub async fn load_older(&self, limit: u32) -> Result<usize> {
        let (generation, channel, partner) = self.inner.current_session().await?;
        let before = {
            let session = self.inner.shared.lock().await;
            session.timeline.oldest_cursor()
        };
        // An empty timeline means there is nothing to anchor on; the
        // newest window comes from session start, not from here.
        let Some(before) = before else { return Ok(0) };

        let mut page: Vec<StoredMessage> = match &self.inner.store {
            Some(store) => store.lock().await.messages_before(&channel, &before, limit)?,
            None => Vec::new(),
        };

        if (page.len() as u32) < limit {
            let fetch_before = page.first().map(|m| m.cursor()).unwrap_or(before);
            match self
                .inner
                .backfill_older(generation, &channel, &partner, fetch_before, limit - page.len() as u32)
                .await
            {
                Ok(fetched) if !fetched.is_empty() => match &self.inner.store {
                    Some(store) => {
                        // Re-read so the final page reflects the rows just
                        // persisted.
                        page = store.lock().await.messages_before(&channel, &before, limit)?;
                    }
                    None => {
                        page.splice(0..0, fetched);
                        if page.len() as u32 > limit {
                            let excess = page.len() - limit as usize;
                            page.drain(0..excess);
                        }
                    }
                },
                Ok(_) => {}
                Err(err) => {
                    warn!(channel = %channel, error = %err, "cloud history fetch failed; serving local rows only");
                    self.inner.surface_error(&err).await;
                }
            }
        }

        let ids: Vec<Uuid> = page.iter().map(|m| m.id).collect();
        let (receipts, reactions) = match &self.inner.store {
            Some(store) => {
                let store = store.lock().await;
                (
                    store.get_receipts_for_messages(&channel, &ids)?,
                    store.get_reactions_for_messages(&channel, &ids)?,
                )
            }
            None => (HashMap::new(), HashMap::new()),
        };

        let mut session = self.inner.shared.lock().await;
        if session.generation != generation {
            return Ok(0);
        }
        let added = session.timeline.prepend_older(page);
        session.timeline.hydrate(&receipts, &reactions);
        Ok(added)
    }

    /// Record that the local user read `message_id`, creating the receipt
    /// row if the delivery path has not yet.
    pub async fn mark_read(&self, message_id: Uuid) -> Result<()> {
        let (generation, channel, _partner) = self.inner.current_session().await?;
        let read_at_ms = time::now_ms();

        // The timeline entry supplies the receipt parties when no row
        // exists yet.
        let template = {
            let session = self.inner.shared.lock().await;
            session
                .timeline
                .entries()
                .iter()
                .find(|entry| entry.message.id == message_id)
                .map(|entry| (entry.message.sender.clone(), entry.message.recipient.clone()))
        };

        let mut receipt: Option<DeliveryReceipt> = None;
        if let Some(store) = &self.inner.store {
            let store = store.lock().await;
            if store.mark_read(&channel, message_id, read_at_ms)? {
                receipt = store.get_receipt(&channel, message_id)?;
            } else {
                let (sender, recipient) = match &template {
                    Some(pair) => pair.clone(),
                    None => {
                        let message = store.get_message_by_id(&channel, message_id)?;
                        (message.sender, message.recipient)
                    }
                };
                let fresh = DeliveryReceipt {
                    channel: channel.clone(),
                    message_id,
                    sender,
                    recipient,
                    delivered_at_ms: read_at_ms,
                    read_at_ms: Some(read_at_ms),
                    updated_at_ms: read_at_ms,
                };
                store.upsert_receipt(&fresh)?;
                receipt = Some(fresh);
            }
        } else if let Some((sender, recipient)) = template {
            receipt = Some(DeliveryReceipt {
                channel: channel.clone(),
                message_id,
                sender,
                recipient,
                delivered_at_ms: read_at_ms,
                read_at_ms: Some(read_at_ms),
                updated_at_ms: read_at_ms,
            });
        }

        if let Some(receipt) = receipt {
            {
                let mut session = self.inner.shared.lock().await;
                if session.generation == generation {
                    session.timeline.set_receipt(receipt);
                }
            }
            self.inner
                .emit(SyncEvent::MetadataChanged { channel, message_id })
                .await;
        }
        Ok(())
    }

    /// Set or replace the local user's reaction on a message.
    pub async fn set_reaction(&self, message_id: Uuid, emoji: String) -> Result<()> {
        let (generation, channel, _partner) = self.inner.current_session().await?;
        let reaction = Reaction {
            channel: channel.clone(),
            message_id,
            reactor: self.inner.local.clone(),
            emoji,
            updated_at_ms: time::now_ms(),
        };
        if let Some(store) = &self.inner.store {
            store.lock().await.set_reaction(&reaction)?;
        }
        {
            let mut session = self.inner.shared.lock().await;
            if session.generation == generation {
                session.timeline.set_reaction(reaction);
            }
        }
        self.inner
            .emit(SyncEvent::MetadataChanged { channel, message_id })
            .await;
        Ok(())
    }

    pub async fn clear_reaction(&self, message_id: Uuid) -> Result<()> {
        let (generation, channel, _partner) = self.inner.current_session().await?;
        if let Some(store) = &self.inner.store {
            store.lock().await.clear_reaction(&channel, message_id, &self.inner.local)?;
        }
        {
            let mut session = self.inner.shared.lock().await;
            if session.generation == generation {
                session.timeline.clear_reaction(message_id, &self.inner.local);
            }
        }
        self.inner
            .emit(SyncEvent::MetadataChanged { channel, message_id })
            .await;
        Ok(())
    }

    /// Stop the session and erase every local trace of the channel.
    /// Cloud copies are untouched.
    pub async fn delete_channel(&self) -> Result<()> {
        let (_generation, channel, _partner) = self.inner.current_session().await?;
        self.stop().await;
        if let Some(store) = &self.inner.store {
            store.lock().await.delete_channel(&channel)?;
        }
        info!(channel = %channel, "channel deleted");
        self.inner.emit(SyncEvent::ChannelDeleted { channel }).await;
        Ok(())
    }

    /// Record and install a (possibly rotated) partner public key for the
    /// active channel.
    pub async fn establish_partner_key(&self, partner_public: [u8; 32]) -> Result<()> {
        let (_generation, _channel, partner) = self.inner.current_session().await?;
        let mut cipher = self.inner.cipher.lock().await;
        cipher.observe_partner_key(&partner, partner_public);
        cipher
            .establish_shared_key(&partner_public, &partner)
            .map_err(SyncError::from_cipher)?;
        Ok(())
    }

    /// A point-in-time copy of the merged timeline, oldest first.
    pub async fn timeline_snapshot(&self) -> Vec<TimelineEntry> {
        let session = self.inner.shared.lock().await;
        session.timeline.entries().to_vec()
    }

    /// Snap the in-memory window back to the configured cap, dropping the
    /// oldest explicitly loaded history.
    pub async fn trim_timeline(&self) {
        let mut session = self.inner.shared.lock().await;
        let cap = self.inner.config.timeline_cap;
        session.timeline.trim_to(cap);
    }

    fn spawn_drain(&self, generation: u64, channel: ChannelId) {
        enum Step {
            Run,
            WaitUntil(Instant),
            Wait,
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let step = {
                    let mut session = inner.shared.lock().await;
                    if session.generation != generation {
                        break;
                    }
                    if session.run_now {
                        session.run_now = false;
                        Step::Run
                    } else if let Some(deadline) = session.armed_deadline {
                        if Instant::now() >= deadline {
                            session.armed_deadline = None;
                            Step::Run
                        } else {
                            Step::WaitUntil(deadline)
                        }
                    } else {
                        Step::Wait
                    }
                };
                match step {
                    Step::Run => inner.drain_cycle(generation, &channel).await,
                    Step::WaitUntil(deadline) => {
                        tokio::select! {
                            _ = inner.drain_notify.notified() => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                        }
                    }
                    Step::Wait => inner.drain_notify.notified().await,
                }
            }
            debug!(channel = %channel, "drain loop stopped");
        });
        self.inner.track_task(handle);
    }

    fn spawn_subscription(
        &self,
        generation: u64,
        channel: ChannelId,
        partner: UserId,
        from: Option<EnvelopeCursor>,
    ) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut subscription = match inner.transport.subscribe(&channel, from).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    let err = SyncError::from(err);
                    warn!(channel = %channel, error = %err, "live subscription failed to open");
                    inner.surface_error(&err).await;
                    return;
                }
            };
            debug!(channel = %channel, "live subscription open");
            while let Some(batch) = subscription.next_batch().await {
                {
                    let session = inner.shared.lock().await;
                    if session.generation != generation {
                        break;
                    }
                }
                if !batch.contiguous {
                    inner.flag_gap(&channel).await;
                }
                if !batch.envelopes.is_empty() {
                    inner
                        .ingest_envelopes(generation, &channel, &partner, batch.envelopes, IngestMode::Live)
                        .await;
                }
            }
            debug!(channel = %channel, "live subscription closed");
        });
        self.inner.track_task(handle);
    }
}

impl Drop for MessageSyncService {
    fn drop(&mut self) {
        self.inner.abort_tasks();
    }
}

impl ServiceInner {
    async fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event).await;
    }

    /// Push an error at the session owner, rate-limited per category.
    async fn surface_error(&self, err: &SyncError) {
        let category = err.category();
        if self.throttle.should_surface(category.as_str()).await {
            self.emit(SyncEvent::ErrorSurfaced {
                category,
                message: err.to_string(),
            })
            .await;
        }
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    async fn current_session(&self) -> Result<(u64, ChannelId, UserId)> {
        let session = self.shared.lock().await;
        match (&session.channel, &session.partner) {
            (Some(channel), Some(partner)) => {
                Ok((session.generation, channel.clone(), partner.clone()))
            }
            _ => Err(SyncError::Policy("no active sync session".to_string())),
        }
    }

    async fn schedule_drain_now(&self) {
        {
            let mut session = self.shared.lock().await;
            session.run_now = true;
        }
        self.drain_notify.notify_one();
    }

    async fn evaluate_bootstrap(&self, channel: &ChannelId) -> Result<BootstrapDecision> {
        let Some(store) = &self.store else {
            debug!(channel = %channel, "no local store; skipping bootstrap");
            return Ok(BootstrapDecision::Skip);
        };
        let store = store.lock().await;
        let state = store.get_sync_state(&self.local, channel)?;
        let count = store.message_count(channel)?;
        Ok(bootstrap::decide(
            state.as_ref(),
            count,
            self.config.schema_version,
            &self.config.app_version,
            self.config.feature_enabled,
        ))
    }

    /// Replace the timeline with the newest stored page plus its metadata.
    async fn seed_timeline(&self, generation: u64, channel: &ChannelId) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let (messages, receipts, reactions) = {
            let store = store.lock().await;
            let messages = store.recent_messages(channel, self.config.backfill_page_size)?;
            let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
            let receipts = store.get_receipts_for_messages(channel, &ids)?;
            let reactions = store.get_reactions_for_messages(channel, &ids)?;
            (messages, receipts, reactions)
        };
        let mut session = self.shared.lock().await;
        if session.generation != generation {
            return Ok(());
        }
        session.timeline = MessageTimeline::new(self.config.timeline_cap);
        for message in messages {
            session.timeline.append_if_needed(message);
        }
        session.timeline.hydrate(&receipts, &reactions);
        Ok(())
    }

    /// The live-feed resume point derived from the persisted cursor.
    ///
    /// The relay keys envelopes by whole seconds, so the cursor is rewound
    /// one second with a nil id floor; replaying the boundary overlap is
    /// safe because merging deduplicates by id.
    async fn resume_cursor(&self, channel: &ChannelId) -> Option<EnvelopeCursor> {
        let store = self.store.as_ref()?;
        let state: Option<SyncState> = match store.lock().await.get_sync_state(&self.local, channel)
        {
            Ok(state) => state,
            Err(err) => {
                warn!(channel = %channel, error = %err, "reading the resume cursor failed");
                return None;
            }
        };
        state.and_then(|s| s.cursor()).map(|cursor| EnvelopeCursor {
            sent_at_secs: time::ms_to_secs(cursor.sent_at_ms) - 1,
            id: Uuid::nil(),
        })
    }

    /// Page cloud history into the local store, newest first, until the
    /// stored floor is reached or the page budget runs out. Failures leave
    /// the bootstrap marked incomplete so the next session resumes it.
    async fn run_bootstrap(
        &self,
        generation: u64,
        channel: &ChannelId,
        partner: &UserId,
        reason: BootstrapReason,
    ) {
        let Some(store) = self.store.clone() else {
            return;
        };
        info!(channel = %channel, reason = reason.as_str(), "bootstrapping channel from cloud");

        let floor: Option<SyncCursor> = {
            let store = store.lock().await;
            match store.get_sync_state(&self.local, channel) {
                Ok(state) => state.and_then(|s| s.cursor()),
                Err(err) => {
                    let err = SyncError::from(err);
                    warn!(channel = %channel, error = %err, "reading the backfill floor failed");
                    self.surface_error(&err).await;
                    None
                }
            }
        };
        {
            let store = store.lock().await;
            if let Err(err) = store
                .mark_bootstrap_started(&self.local, channel, self.config.schema_version, &self.config.app_version)
                .map_err(SyncError::from)
            {
                warn!(channel = %channel, error = %err, "persisting bootstrap start failed");
                drop(store);
                self.surface_error(&err).await;
            }
        }

        let page_size = self.config.backfill_page_size;
        let mut persisted_total = 0usize;
        let mut oldest_seen: Option<EnvelopeCursor> = None;

        for page_index in 0..self.config.max_backfill_pages {
            let fetched = if page_index == 0 {
                self.transport.fetch_recent(channel, page_size).await
            } else {
                self.transport.fetch_older(channel, oldest_seen, page_size).await
            };
            let envelopes = match fetched {
                Ok(envelopes) => envelopes,
                Err(err) => {
                    let err = SyncError::from(err);
                    warn!(
                        channel = %channel,
                        page = page_index,
                        error = %err,
                        "bootstrap fetch failed; leaving bootstrap incomplete"
                    );
                    self.surface_error(&err).await;
                    return;
                }
            };
            if envelopes.is_empty() {
                break;
            }
            let page_len = envelopes.len() as u32;
            oldest_seen = Some(EnvelopeCursor::for_envelope(&envelopes[0]));

            let outcome = self
                .ingest_envelopes(generation, channel, partner, envelopes, IngestMode::Backfill)
                .await;
            persisted_total += outcome.persisted;

            let reached_floor = match (floor, outcome.oldest_cursor) {
                (Some(floor), Some(oldest)) => {
                    (oldest.sent_at_ms, oldest.message_id) <= (floor.sent_at_ms, floor.message_id)
                }
                _ => false,
            };
            if page_len < page_size || reached_floor {
                break;
            }
        }

        // The completion cursor comes from the store, so it always points
        // at a row that exists locally.
        let cursor: Option<SyncCursor> = {
            let store = store.lock().await;
            match store.latest_message(channel) {
                Ok(latest) => latest.map(|m| m.cursor()),
                Err(err) => {
                    let err = SyncError::from(err);
                    warn!(channel = %channel, error = %err, "reading the completion cursor failed");
                    drop(store);
                    self.surface_error(&err).await;
                    return;
                }
            }
        };
        {
            let store = store.lock().await;
            if let Err(err) = store
                .mark_bootstrap_completed(
                    &self.local,
                    channel,
                    cursor.as_ref(),
                    self.config.schema_version,
                    &self.config.app_version,
                )
                .map_err(SyncError::from)
            {
                warn!(channel = %channel, error = %err, "persisting bootstrap completion failed");
                drop(store);
                self.surface_error(&err).await;
                return;
            }
        }

        let still_current = self.shared.lock().await.generation == generation;
        if still_current {
            info!(channel = %channel, inserted = persisted_total, "bootstrap completed");
            self.emit(SyncEvent::BootstrapCompleted {
                channel: channel.clone(),
                inserted: persisted_total,
            })
            .await;
        }
    }

    /// Decrypt, decode, persist, and merge a batch of cloud envelopes.
    /// One bad envelope never aborts the batch.
    async fn ingest_envelopes(
        &self,
        generation: u64,
        channel: &ChannelId,
        partner: &UserId,
        envelopes: Vec<CloudEnvelope>,
        mode: IngestMode,
    ) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let mut messages: Vec<StoredMessage> = Vec::with_capacity(envelopes.len());
        let mut acks: Vec<Uuid> = Vec::new();

        for envelope in &envelopes {
            let payload = match self.decrypt_envelope(generation, envelope, partner).await {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            let direction = if envelope.sender == self.local {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            let message = StoredMessage {
                id: envelope.id,
                owner: self.local.clone(),
                channel: channel.clone(),
                sender: envelope.sender.clone(),
                recipient: envelope.recipient.clone(),
                // The authoritative millisecond timestamp rides inside the
                // sealed payload; the envelope only carries coarse seconds.
                sent_at_ms: payload.sent_at_ms,
                kind: payload.kind,
                value: payload.value,
                is_secret: payload.is_secret,
                direction,
                upload_state: match direction {
                    // Echoed back by the relay, so it is already uploaded.
                    Direction::Outbound => Some(UploadState::Uploaded),
                    Direction::Inbound => None,
                },
                created_at_ms: time::now_ms(),
            };
            if direction == Direction::Inbound && message.recipient == self.local {
                acks.push(message.id);
            }
            messages.push(message);
        }

        if messages.is_empty() {
            return outcome;
        }

        let mut oldest = messages[0].cursor();
        let mut newest = messages[0].cursor();
        for message in &messages[1..] {
            let key = (message.sent_at_ms, message.id);
            if key < (oldest.sent_at_ms, oldest.message_id) {
                oldest = message.cursor();
            }
            if key > (newest.sent_at_ms, newest.message_id) {
                newest = message.cursor();
            }
        }
        outcome.oldest_cursor = Some(oldest);

        // Persist with one batched insert per direction group, then move
        // the cursor and record delivery receipts.
        let mut errors: Vec<SyncError> = Vec::new();
        if let Some(store) = &self.store {
            let (inbound, outbound): (Vec<StoredMessage>, Vec<StoredMessage>) = messages
                .iter()
                .cloned()
                .partition(|m| m.direction == Direction::Inbound);
            let mut store = store.lock().await;
            for group in [&outbound, &inbound] {
                if group.is_empty() {
                    continue;
                }
                match store.insert_messages_if_absent(group) {
                    Ok(n) => outcome.persisted += n,
                    Err(err) => errors.push(err.into()),
                }
            }
            if errors.is_empty() {
                if let Err(err) = store.advance_cursor(&self.local, channel, &newest) {
                    errors.push(err.into());
                }
                let delivered_at_ms = time::now_ms();
                for message in &inbound {
                    let receipt = DeliveryReceipt {
                        channel: channel.clone(),
                        message_id: message.id,
                        sender: message.sender.clone(),
                        recipient: message.recipient.clone(),
                        delivered_at_ms,
                        read_at_ms: None,
                        updated_at_ms: delivered_at_ms,
                    };
                    if let Err(err) = store.upsert_receipt(&receipt) {
                        errors.push(err.into());
                        break;
                    }
                }
            }
        }
        for err in &errors {
            warn!(channel = %channel, error = %err, "persisting merged envelopes failed");
            self.surface_error(err).await;
        }

        // Session-side effects, gated on the session still being current.
        let mut fresh_events: Vec<SyncEvent> = Vec::new();
        {
            let mut session = self.shared.lock().await;
            if session.generation != generation {
                outcome.messages = messages;
                return outcome;
            }
            session.pending_acks.extend(acks.iter().copied());
            match mode {
                IngestMode::History => {}
                IngestMode::Backfill => {
                    for message in &messages {
                        session.timeline.append_if_needed(message.clone());
                    }
                }
                IngestMode::Live => {
                    for message in &messages {
                        if session.timeline.append_if_needed(message.clone()) {
                            fresh_events.push(SyncEvent::MessageAdded {
                                message: message.clone(),
                                source: MessageSource::CloudStream,
                            });
                        }
                    }
                }
            }
        }
        for event in fresh_events {
            self.emit(event).await;
        }
        if !acks.is_empty() {
            self.schedule_drain_now().await;
        }

        outcome.messages = messages;
        outcome
    }

    /// Decrypt and decode one envelope, with a one-shot key
    /// re-establishment from the last observed partner key when the
    /// failure class is recoverable.
    async fn decrypt_envelope(
        &self,
        generation: u64,
        envelope: &CloudEnvelope,
        partner: &UserId,
    ) -> Result<MessagePayload> {
        let err = match self.try_decode(envelope, partner).await {
            Ok(payload) => {
                self.note_decrypt_ok(generation).await;
                return Ok(payload);
            }
            Err(err) => err,
        };

        if err.is_recoverable_crypto() {
            let reestablished = {
                let mut cipher = self.cipher.lock().await;
                match cipher.observed_partner_key(partner) {
                    Some(key) => cipher.establish_shared_key(&key, partner).is_ok(),
                    None => false,
                }
            };
            if reestablished {
                debug!(partner = %partner.short(), "re-established shared key; retrying decryption");
                match self.try_decode(envelope, partner).await {
                    Ok(payload) => {
                        self.note_decrypt_ok(generation).await;
                        return Ok(payload);
                    }
                    Err(second) => {
                        self.note_decrypt_failure(generation, envelope, &second).await;
                        return Err(second);
                    }
                }
            }
        }

        self.note_decrypt_failure(generation, envelope, &err).await;
        Err(err)
    }

    async fn try_decode(&self, envelope: &CloudEnvelope, partner: &UserId) -> Result<MessagePayload> {
        let plaintext = {
            let cipher = self.cipher.lock().await;
            cipher
                .decrypt(&envelope.ciphertext, partner)
                .map_err(SyncError::from_cipher)?
        };
        Ok(MessagePayload::from_bytes(&plaintext)?)
    }

    async fn note_decrypt_ok(&self, generation: u64) {
        let mut session = self.shared.lock().await;
        if session.generation == generation && session.warned_decrypt {
            session.warned_decrypt = false;
            debug!("decryption recovered");
        }
    }

    /// Log the first failure of a streak at warn, the rest silently; every
    /// failure still goes through the throttled surface path.
    async fn note_decrypt_failure(&self, generation: u64, envelope: &CloudEnvelope, err: &SyncError) {
        let first_of_streak = {
            let mut session = self.shared.lock().await;
            if session.generation != generation || session.warned_decrypt {
                false
            } else {
                session.warned_decrypt = true;
                true
            }
        };
        if first_of_streak {
            warn!(
                message_id = %envelope.id,
                error = %err,
                "skipping undecryptable envelope; suppressing repeats until one succeeds"
            );
        }
        self.surface_error(err).await;
    }

    async fn flag_gap(&self, channel: &ChannelId) {
        warn!(channel = %channel, "live feed resumed with a gap; flagging for re-bootstrap");
        if let Some(store) = &self.store {
            let result = store.lock().await.mark_gap_detected(&self.local, channel);
            if let Err(err) = result {
                let err = SyncError::from(err);
                warn!(channel = %channel, error = %err, "persisting the gap flag failed");
                self.surface_error(&err).await;
            }
        }
        self.emit(SyncEvent::GapDetected {
            channel: channel.clone(),
        })
        .await;
    }

    /// One pass over the pending uploads and owed acks. A clean pass with
    /// nothing left resets the retry state; any failure arms the backoff
    /// timer (keeping the earliest already-armed deadline).
    async fn drain_cycle(&self, generation: u64, channel: &ChannelId) {
        {
            let session = self.shared.lock().await;
            if session.generation != generation {
                return;
            }
        }

        let mut failed = false;
        let mut retry_hint_ms: Option<u64> = None;
        let mut leftovers = false;

        // Pending and previously failed uploads, oldest first.
        let pending = match &self.store {
            Some(store) => match store.lock().await.pending_uploads(channel, self.config.drain_batch) {
                Ok(pending) => pending,
                Err(err) => {
                    let err = SyncError::from(err);
                    warn!(channel = %channel, error = %err, "reading the upload queue failed");
                    self.surface_error(&err).await;
                    failed = true;
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if pending.len() as u32 == self.config.drain_batch {
            leftovers = true;
        }

        for message in pending {
            match self.upload_message(channel, &message).await {
                Ok(()) => {
                    if let Some(store) = &self.store {
                        let result = store.lock().await.mark_uploaded(channel, message.id);
                        if let Err(err) = result {
                            let err = SyncError::from(err);
                            warn!(channel = %channel, message_id = %message.id, error = %err, "recording upload success failed");
                            self.surface_error(&err).await;
                            failed = true;
                        }
                    }
                    {
                        let mut session = self.shared.lock().await;
                        if session.generation == generation {
                            session.timeline.mark_uploaded(message.id);
                        }
                    }
                    self.emit(SyncEvent::MessageUploaded {
                        channel: channel.clone(),
                        message_id: message.id,
                    })
                    .await;
                }
                Err(err) => {
                    failed = true;
                    if let SyncError::Transport(transport_err) = &err {
                        if let Some(hint) = transport_err.retry_after_ms() {
                            retry_hint_ms = Some(retry_hint_ms.map_or(hint, |h| h.max(hint)));
                        }
                    }
                    warn!(channel = %channel, message_id = %message.id, error = %err, "upload attempt failed");
                    if let Some(store) = &self.store {
                        let result = store.lock().await.mark_upload_failed(channel, message.id);
                        if let Err(mark_err) = result {
                            warn!(channel = %channel, message_id = %message.id, error = %mark_err, "recording upload failure failed");
                        }
                    }
                    self.surface_error(&err).await;
                }
            }
        }

        // Owed acks. Failed ones re-enter the queue in order and ride the
        // same retry timer; they never hold back message visibility.
        let acks: Vec<Uuid> = {
            let mut session = self.shared.lock().await;
            if session.generation != generation {
                return;
            }
            let take = (self.config.drain_batch as usize).min(session.pending_acks.len());
            session.pending_acks.drain(..take).collect()
        };
        let mut requeue: Vec<Uuid> = Vec::new();
        for message_id in acks {
            match self.transport.ack(channel, message_id).await {
                Ok(()) => {}
                Err(err) => {
                    let err = SyncError::from(err);
                    if let SyncError::Transport(transport_err) = &err {
                        if let Some(hint) = transport_err.retry_after_ms() {
                            retry_hint_ms = Some(retry_hint_ms.map_or(hint, |h| h.max(hint)));
                        }
                    }
                    debug!(channel = %channel, message_id = %message_id, error = %err, "ack attempt failed");
                    requeue.push(message_id);
                    failed = true;
                    self.surface_error(&err).await;
                }
            }
        }

        let mut retry_event: Option<SyncEvent> = None;
        {
            let mut session = self.shared.lock().await;
            if session.generation != generation {
                return;
            }
            for message_id in requeue.into_iter().rev() {
                session.pending_acks.push_front(message_id);
            }
            if !session.pending_acks.is_empty() {
                leftovers = true;
            }
            if failed {
                session.drain_failures += 1;
                let delay = self
                    .config
                    .retry
                    .delay_after_failures(session.drain_failures, retry_hint_ms);
                let deadline = Instant::now() + delay;
                session.armed_deadline = Some(match session.armed_deadline {
                    Some(existing) => existing.min(deadline),
                    None => deadline,
                });
                debug!(
                    channel = %channel,
                    failures = session.drain_failures,
                    delay_ms = delay.as_millis() as u64,
                    "drain cycle failed; retry armed"
                );
                retry_event = Some(SyncEvent::RetryScheduled {
                    channel: channel.clone(),
                    delay,
                    consecutive_failures: session.drain_failures,
                });
            } else if leftovers {
                session.run_now = true;
            } else {
                if session.drain_failures > 0 {
                    debug!(channel = %channel, "drain recovered; retry state reset");
                }
                session.drain_failures = 0;
                session.armed_deadline = None;
            }
        }
        if let Some(event) = retry_event {
            self.emit(event).await;
        }
    }

    /// Seal and push one stored message to the relay.
    async fn upload_message(&self, channel: &ChannelId, message: &StoredMessage) -> Result<()> {
        let payload = MessagePayload {
            kind: message.kind,
            value: message.value.clone(),
            is_secret: message.is_secret,
            sent_at_ms: message.sent_at_ms,
        };
        let bytes = payload.to_bytes()?;
        let ciphertext = {
            let cipher = self.cipher.lock().await;
            cipher
                .encrypt(&bytes, &message.recipient)
                .map_err(SyncError::from_cipher)?
        };
        let envelope = CloudEnvelope {
            id: message.id,
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            ciphertext,
            sent_at_secs: time::ms_to_secs(message.sent_at_ms),
        };
        self.transport.send_envelope(channel, &envelope).await?;
        Ok(())
    }

    /// Fetch cloud envelopes strictly older than `before`, persist them,
    /// and return the decoded rows that precede the cursor, ascending.
    async fn backfill_older(
        &self,
        generation: u64,
        channel: &ChannelId,
        partner: &UserId,
        before: SyncCursor,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let page_size = self.config.backfill_page_size.max(limit);
        let mut collected: Vec<StoredMessage> = Vec::new();
        // Over-approximate the second-granular bound; decoded rows are
        // filtered against the precise cursor below.
        let mut fetch_cursor = EnvelopeCursor {
            sent_at_secs: time::ms_to_secs(before.sent_at_ms) + 1,
            id: Uuid::nil(),
        };

        let mut empty_pages = 0u32;
        for _ in 0..self.config.max_backfill_pages {
            let envelopes = self
                .transport
                .fetch_older(channel, Some(fetch_cursor), page_size)
                .await?;
            if envelopes.is_empty() {
                // One re-probe at the same cursor; a second empty page is
                // definitive. A short non-empty page ends paging below.
                empty_pages += 1;
                if empty_pages >= 2 {
                    break;
                }
                continue;
            }
            empty_pages = 0;
            let short = (envelopes.len() as u32) < page_size;
            fetch_cursor = EnvelopeCursor::for_envelope(&envelopes[0]);

            let outcome = self
                .ingest_envelopes(generation, channel, partner, envelopes, IngestMode::History)
                .await;
            let older = outcome
                .messages
                .into_iter()
                .filter(|m| (m.sent_at_ms, m.id) < (before.sent_at_ms, before.message_id));
            collected.splice(0..0, older);

            if collected.len() as u32 >= limit || short {
                break;
            }
        }

        if collected.len() as u32 > limit {
            let excess = collected.len() - limit as usize;
            collected.drain(0..excess);
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use tandem_shared::PairwiseCipher;

    fn service_without_store() -> (MessageSyncService, mpsc::Receiver<SyncEvent>) {
        let local = UserId::new("alice");
        let partner = UserId::new("bob");
        let channel = ChannelId::for_pair(&local, &partner);
        MessageSyncService::new(
            SyncConfig::default(),
            local,
            None,
            Arc::new(MemoryTransport::new()),
            Box::new(PairwiseCipher::generate(channel)),
        )
    }

    #[tokio::test]
    async fn sending_without_a_session_is_rejected() {
        let (service, _events) = service_without_store();
        let err = service
            .send(PayloadKind::Text, "hello".to_string(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Policy(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (service, _events) = service_without_store();
        service.stop().await;
        service.stop().await;
        assert!(service.timeline_snapshot().await.is_empty());
    }
}
