//! # tandem-smoke
//!
//! Self-contained smoke run for the sync engine: two parties, one
//! in-memory relay, real SQLite stores in a scratch directory.
//!
//! The run walks through:
//! - **Pairing** (x25519 key exchange before the first message)
//! - **Bootstrap** (a fresh device pulling relay history it never saw)
//! - **Live delivery** with delivery receipts and relay acks
//! - **Local metadata** (read receipts and reactions)
//! - **Offline queueing** drained with backoff once the relay returns
//!
//! The log stream is the output; run with `RUST_LOG=debug` for the full
//! picture.

use std::sync::Arc;
use std::time::Duration;

use tandem_shared::{ChannelCipher, ChannelId, PairwiseCipher, PayloadKind, UserId};
use tandem_store::Database;
use tandem_sync::backoff::RetryPolicy;
use tandem_sync::{MemoryTransport, MessageSyncService, SyncConfig, SyncEvent};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tandem_sync=debug")),
        )
        .init();

    info!("Starting Tandem smoke run v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Scratch stores, one SQLite file per party
    // -----------------------------------------------------------------------
    let scratch = TempDir::new()?;
    let alice = UserId::new("alice@smoke");
    let bob = UserId::new("bob@smoke");
    let channel = ChannelId::for_pair(&alice, &bob);
    info!(channel = %channel, dir = %scratch.path().display(), "Opening stores");

    let alice_store = Database::open_at(&scratch.path().join("alice.db"))?;
    let bob_store = Database::open_at(&scratch.path().join("bob.db"))?;

    // -----------------------------------------------------------------------
    // 3. Pairing: exchange public keys and derive the channel key
    // -----------------------------------------------------------------------
    let mut alice_cipher = PairwiseCipher::generate(channel.clone());
    let mut bob_cipher = PairwiseCipher::generate(channel.clone());
    let alice_public = alice_cipher.public_key();
    let bob_public = bob_cipher.public_key();
    alice_cipher.establish_shared_key(&bob_public, &bob)?;
    bob_cipher.establish_shared_key(&alice_public, &alice)?;
    info!("Pairing complete, both parties hold the derived channel key");

    // -----------------------------------------------------------------------
    // 4. Bob comes online first and leaves history on the relay
    // -----------------------------------------------------------------------
    let relay = MemoryTransport::new();
    let config = SyncConfig {
        // Short backoff so the offline window below stays watchable.
        retry: RetryPolicy::new(200, 2_000),
        ..SyncConfig::default()
    };

    let (bob_service, bob_events) = MessageSyncService::new(
        config.clone(),
        bob.clone(),
        Some(bob_store),
        Arc::new(relay.clone()),
        Box::new(bob_cipher),
    );
    spawn_event_logger("bob", bob_events);
    bob_service.start(alice.clone()).await?;
    bob_service
        .send(PayloadKind::Text, "ahoy from the first device".into(), false)
        .await?;
    bob_service.send(PayloadKind::Emoji, "👋".into(), false).await?;
    settle().await;

    // -----------------------------------------------------------------------
    // 5. Alice starts fresh and bootstraps the history she missed
    // -----------------------------------------------------------------------
    let (alice_service, alice_events) = MessageSyncService::new(
        config,
        alice.clone(),
        Some(alice_store),
        Arc::new(relay.clone()),
        Box::new(alice_cipher),
    );
    spawn_event_logger("alice", alice_events);
    alice_service.start(bob.clone()).await?;
    settle().await;

    // -----------------------------------------------------------------------
    // 6. Live traffic and metadata
    // -----------------------------------------------------------------------
    let reply = alice_service
        .send(PayloadKind::Text, "bootstrap caught me up".into(), false)
        .await?;
    settle().await;

    bob_service.mark_read(reply.id).await?;
    bob_service.set_reaction(reply.id, "🔥".into()).await?;
    settle().await;

    // -----------------------------------------------------------------------
    // 7. Offline window: queue a send, then watch the drain recover
    // -----------------------------------------------------------------------
    relay.set_offline(true).await;
    let queued = alice_service
        .send(PayloadKind::Text, "typed in a tunnel".into(), false)
        .await?;
    info!(message_id = %queued.id, "Send accepted while the relay is down");
    tokio::time::sleep(Duration::from_millis(600)).await;
    relay.set_offline(false).await;
    info!("Relay is back");
    settle().await;

    // -----------------------------------------------------------------------
    // 8. Final state
    // -----------------------------------------------------------------------
    for (party, service) in [("alice", &alice_service), ("bob", &bob_service)] {
        let timeline = service.timeline_snapshot().await;
        info!(party, messages = timeline.len(), "Final timeline");
        for entry in &timeline {
            info!(
                party,
                sender = %entry.message.sender.short(),
                kind = ?entry.message.kind,
                value = %entry.message.value,
                upload = ?entry.message.upload_state,
                read = entry
                    .receipt
                    .as_ref()
                    .map(|r| r.read_at_ms.is_some())
                    .unwrap_or(false),
                reactions = entry.reactions.len(),
                "timeline entry"
            );
        }
    }
    info!(
        stored = relay.stored(&channel).await.len(),
        acked = relay.acked(&channel).await.len(),
        "Relay ledger"
    );

    alice_service.stop().await;
    bob_service.stop().await;
    info!("Smoke run complete");
    Ok(())
}

/// Give the background tasks a beat to flush deliveries and acks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

fn spawn_event_logger(party: &'static str, mut events: mpsc::Receiver<SyncEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::SessionStarted { channel, bootstrap } => {
                    info!(party, channel = %channel, bootstrap = ?bootstrap, "session started");
                }
                SyncEvent::BootstrapCompleted { inserted, .. } => {
                    info!(party, inserted, "bootstrap completed");
                }
                SyncEvent::MessageAdded { message, source } => {
                    info!(
                        party,
                        source = ?source,
                        sender = %message.sender.short(),
                        value = %message.value,
                        "message added"
                    );
                }
                SyncEvent::MessageUploaded { message_id, .. } => {
                    info!(party, message_id = %message_id, "message uploaded");
                }
                SyncEvent::RetryScheduled {
                    delay,
                    consecutive_failures,
                    ..
                } => {
                    info!(party, ?delay, consecutive_failures, "retry scheduled");
                }
                SyncEvent::MetadataChanged { message_id, .. } => {
                    info!(party, message_id = %message_id, "metadata changed");
                }
                SyncEvent::GapDetected { channel } => {
                    info!(party, channel = %channel, "history gap detected");
                }
                SyncEvent::ChannelDeleted { channel } => {
                    info!(party, channel = %channel, "channel deleted");
                }
                SyncEvent::ErrorSurfaced { category, message } => {
                    info!(party, category = category.as_str(), message = %message, "error surfaced");
                }
            }
        }
    });
}
