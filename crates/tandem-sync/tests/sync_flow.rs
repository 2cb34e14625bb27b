//! End-to-end flows over two services sharing one in-memory relay.

use std::sync::Arc;
use std::time::Duration;

use tandem_shared::{
    time, ChannelCipher, ChannelId, CloudEnvelope, MessagePayload, PairwiseCipher, PayloadKind,
    UserId,
};
use tandem_store::{Database, Direction, StoredMessage, UploadState};
use tandem_sync::backoff::RetryPolicy;
use tandem_sync::bootstrap::BootstrapReason;
use tandem_sync::{MemoryTransport, MessageSource, MessageSyncService, SyncConfig, SyncEvent};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn alice() -> UserId {
    UserId::new("alice-device-1")
}

fn bob() -> UserId {
    UserId::new("bob-device-1")
}

/// Millisecond timestamps spaced a minute apart, far enough in the past
/// to be stable and distinct at second granularity.
fn ts(n: i64) -> i64 {
    1_700_000_000_000 + n * 60_000
}

fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::new(50, 2_000),
        ..SyncConfig::default()
    }
}

fn open_store(dir: &TempDir, name: &str) -> Database {
    Database::open_at(&dir.path().join(name)).expect("open store")
}

/// Two ciphers for the same channel with each other's keys installed.
fn paired_ciphers(local: &UserId, partner: &UserId) -> (PairwiseCipher, PairwiseCipher) {
    let channel = ChannelId::for_pair(local, partner);
    let mut ours = PairwiseCipher::generate(channel.clone());
    let mut theirs = PairwiseCipher::generate(channel);
    let our_public = ours.public_key();
    let their_public = theirs.public_key();
    ours.establish_shared_key(&their_public, partner)
        .expect("establish partner key");
    theirs
        .establish_shared_key(&our_public, local)
        .expect("establish local key");
    (ours, theirs)
}

fn sealed(
    cipher: &PairwiseCipher,
    sender: &UserId,
    recipient: &UserId,
    id: Uuid,
    sent_at_ms: i64,
    text: &str,
) -> CloudEnvelope {
    let payload = MessagePayload {
        kind: PayloadKind::Text,
        value: text.to_string(),
        is_secret: false,
        sent_at_ms,
    };
    let bytes = payload.to_bytes().expect("encode payload");
    let ciphertext = cipher.encrypt(&bytes, recipient).expect("encrypt payload");
    CloudEnvelope {
        id,
        sender: sender.clone(),
        recipient: recipient.clone(),
        ciphertext,
        sent_at_secs: time::ms_to_secs(sent_at_ms),
    }
}

fn stored(
    owner: &UserId,
    channel: &ChannelId,
    sender: &UserId,
    recipient: &UserId,
    id: Uuid,
    sent_at_ms: i64,
    value: &str,
) -> StoredMessage {
    let direction = if sender == owner {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    StoredMessage {
        id,
        owner: owner.clone(),
        channel: channel.clone(),
        sender: sender.clone(),
        recipient: recipient.clone(),
        sent_at_ms,
        kind: PayloadKind::Text,
        value: value.to_string(),
        is_secret: false,
        direction,
        upload_state: match direction {
            Direction::Outbound => Some(UploadState::Uploaded),
            Direction::Inbound => None,
        },
        created_at_ms: sent_at_ms,
    }
}

async fn wait_for_event<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a sync event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn live_message_reaches_the_partner_and_gets_acked() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, bob_cipher) = paired_ciphers(&alice(), &bob());

    let (alice_service, mut alice_events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport.clone()),
        Box::new(alice_cipher),
    );
    let (bob_service, mut bob_events) = MessageSyncService::new(
        test_config(),
        bob(),
        Some(open_store(&dir, "bob.db")),
        Arc::new(transport.clone()),
        Box::new(bob_cipher),
    );

    let channel = alice_service.start(bob()).await.expect("alice start");
    bob_service.start(alice()).await.expect("bob start");

    let sent = alice_service
        .send(PayloadKind::Text, "hey bob".to_string(), false)
        .await
        .expect("send");
    assert_eq!(sent.upload_state, Some(UploadState::Pending));

    let added = wait_for_event(&mut bob_events, |event| {
        matches!(
            event,
            SyncEvent::MessageAdded {
                source: MessageSource::CloudStream,
                ..
            }
        )
    })
    .await;
    let SyncEvent::MessageAdded { message, .. } = added else {
        unreachable!()
    };
    assert_eq!(message.id, sent.id);
    assert_eq!(message.value, "hey bob");
    assert_eq!(message.sender, alice());
    assert_eq!(message.direction, Direction::Inbound);

    wait_for_event(&mut alice_events, |event| {
        matches!(event, SyncEvent::MessageUploaded { message_id, .. } if *message_id == sent.id)
    })
    .await;

    // Bob owes the relay an ack and his store a delivery receipt.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if transport.acked(&channel).await.contains(&sent.id) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ack never reached the relay"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let bob_inspect = open_store(&dir, "bob.db");
    let receipt = bob_inspect
        .get_receipt(&channel, sent.id)
        .expect("read receipt")
        .expect("receipt row");
    assert!(receipt.delivered_at_ms > 0);
    assert_eq!(receipt.read_at_ms, None);
}

#[tokio::test]
async fn bootstrap_merges_local_and_cloud_history_exactly_once() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, bob_cipher) = paired_ciphers(&alice(), &bob());
    let channel = ChannelId::for_pair(&alice(), &bob());

    let (a_id, b_id, c_id) = (Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));

    // Local history: [a, b]. Cloud history: [b, c]. The merged timeline
    // must be [a, b, c] with each message exactly once.
    let store = open_store(&dir, "alice.db");
    store
        .insert_message_if_absent(&stored(&alice(), &channel, &alice(), &bob(), a_id, ts(1), "a"))
        .expect("insert a");
    store
        .insert_message_if_absent(&stored(&alice(), &channel, &bob(), &alice(), b_id, ts(2), "b"))
        .expect("insert b");
    transport
        .seed(
            &channel,
            vec![
                sealed(&bob_cipher, &bob(), &alice(), b_id, ts(2), "b"),
                sealed(&bob_cipher, &bob(), &alice(), c_id, ts(3), "c"),
            ],
        )
        .await;

    let (service, mut events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(store),
        Arc::new(transport.clone()),
        Box::new(alice_cipher),
    );
    service.start(bob()).await.expect("start");

    let started = wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::SessionStarted { .. })
    })
    .await;
    assert!(matches!(
        started,
        SyncEvent::SessionStarted {
            bootstrap: Some(BootstrapReason::MissingCursor),
            ..
        }
    ));
    let completed = wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::BootstrapCompleted { .. })
    })
    .await;
    let SyncEvent::BootstrapCompleted { inserted, .. } = completed else {
        unreachable!()
    };
    assert_eq!(inserted, 1, "only the cloud-only message is new");

    let snapshot = service.timeline_snapshot().await;
    let ids: Vec<Uuid> = snapshot.iter().map(|entry| entry.message.id).collect();
    assert_eq!(ids, vec![a_id, b_id, c_id]);

    let inspect = open_store(&dir, "alice.db");
    assert_eq!(inspect.message_count(&channel).expect("count"), 3);
    let state = inspect
        .get_sync_state(&alice(), &channel)
        .expect("read state")
        .expect("state row");
    assert_eq!(state.last_message_id, Some(c_id));
    assert_eq!(state.last_ts_ms, Some(ts(3)));
    assert!(!state.bootstrap_incomplete);
    assert!(!state.gap_detected);
}

#[tokio::test]
async fn corrupt_envelope_is_skipped_without_aborting_the_batch() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, bob_cipher) = paired_ciphers(&alice(), &bob());
    let channel = ChannelId::for_pair(&alice(), &bob());

    let mut tampered = sealed(&bob_cipher, &bob(), &alice(), Uuid::from_u128(2), ts(2), "bad");
    for byte in tampered.ciphertext.iter_mut().skip(24) {
        *byte ^= 0xFF;
    }
    transport
        .seed(
            &channel,
            vec![
                sealed(&bob_cipher, &bob(), &alice(), Uuid::from_u128(1), ts(1), "one"),
                tampered,
                sealed(&bob_cipher, &bob(), &alice(), Uuid::from_u128(3), ts(3), "three"),
            ],
        )
        .await;

    let (service, mut events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport),
        Box::new(alice_cipher),
    );
    service.start(bob()).await.expect("start");

    let snapshot = service.timeline_snapshot().await;
    let values: Vec<&str> = snapshot
        .iter()
        .map(|entry| entry.message.value.as_str())
        .collect();
    assert_eq!(values, vec!["one", "three"]);

    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::ErrorSurfaced { .. })
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn offline_send_is_retried_with_backoff_until_the_relay_returns() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, _bob_cipher) = paired_ciphers(&alice(), &bob());

    let (service, mut events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport.clone()),
        Box::new(alice_cipher),
    );
    transport.set_offline(true).await;
    let channel = service.start(bob()).await.expect("start");

    let sent = service
        .send(PayloadKind::Text, "queued while offline".to_string(), false)
        .await
        .expect("send succeeds against the local store");

    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::RetryScheduled { .. })
    })
    .await;
    assert!(transport.stored(&channel).await.is_empty());

    transport.set_offline(false).await;
    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::MessageUploaded { message_id, .. } if *message_id == sent.id)
    })
    .await;

    assert_eq!(transport.stored(&channel).await.len(), 1);
    let inspect = open_store(&dir, "alice.db");
    let row = inspect
        .get_message_by_id(&channel, sent.id)
        .expect("stored message");
    assert_eq!(row.upload_state, Some(UploadState::Uploaded));
}

#[tokio::test]
async fn pending_upload_survives_a_restart() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, _bob_cipher) = paired_ciphers(&alice(), &bob());
    let (alice_cipher_two, _bob_cipher_two) = {
        // Fresh process, fresh cipher state, same persisted store.
        paired_ciphers(&alice(), &bob())
    };

    transport.set_offline(true).await;
    let (service, _events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport.clone()),
        Box::new(alice_cipher),
    );
    let channel = service.start(bob()).await.expect("start");
    let sent = service
        .send(PayloadKind::Text, "write me down".to_string(), false)
        .await
        .expect("send");
    service.stop().await;
    drop(service);

    transport.set_offline(false).await;
    let (revived, mut events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport.clone()),
        Box::new(alice_cipher_two),
    );
    revived.start(bob()).await.expect("restart");

    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::MessageUploaded { message_id, .. } if *message_id == sent.id)
    })
    .await;
    assert_eq!(transport.stored(&channel).await.len(), 1);

    let snapshot = revived.timeline_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].message.value, "write me down");
}

#[tokio::test]
async fn stale_shared_key_recovers_from_the_observed_partner_key() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let channel = ChannelId::for_pair(&alice(), &bob());

    let mut bob_cipher = PairwiseCipher::generate(channel.clone());
    let mut alice_cipher = PairwiseCipher::generate(channel.clone());
    bob_cipher
        .establish_shared_key(&alice_cipher.public_key(), &alice())
        .expect("bob establishes alice");
    // Alice derived her shared key from an outdated key of Bob's, then
    // observed his current one. Decryption fails once and the engine
    // re-establishes from the observed key on the fly.
    let outdated = PairwiseCipher::generate(channel.clone());
    alice_cipher
        .establish_shared_key(&outdated.public_key(), &bob())
        .expect("establish outdated key");
    alice_cipher.observe_partner_key(&bob(), bob_cipher.public_key());

    transport
        .seed(
            &channel,
            vec![sealed(&bob_cipher, &bob(), &alice(), Uuid::from_u128(7), ts(1), "late key")],
        )
        .await;

    let (service, _events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport),
        Box::new(alice_cipher),
    );
    service.start(bob()).await.expect("start");

    let snapshot = service.timeline_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].message.value, "late key");
}

#[tokio::test]
async fn a_non_contiguous_resume_flags_the_channel_for_rebootstrap() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, bob_cipher) = paired_ciphers(&alice(), &bob());
    let channel = ChannelId::for_pair(&alice(), &bob());

    transport
        .seed(
            &channel,
            vec![sealed(&bob_cipher, &bob(), &alice(), Uuid::from_u128(1), ts(1), "old")],
        )
        .await;

    let (service, mut events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport.clone()),
        Box::new(alice_cipher),
    );
    service.start(bob()).await.expect("first session");
    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::BootstrapCompleted { .. })
    })
    .await;
    service.stop().await;

    // The relay expires everything the cursor points at.
    transport
        .expire_history_before(&channel, time::ms_to_secs(ts(100)))
        .await;

    service.start(bob()).await.expect("second session");
    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::GapDetected { .. })
    })
    .await;
    let inspect = open_store(&dir, "alice.db");
    let state = inspect
        .get_sync_state(&alice(), &channel)
        .expect("read state")
        .expect("state row");
    assert!(state.gap_detected);

    // The flag forces a bootstrap on the next session.
    service.stop().await;
    service.start(bob()).await.expect("third session");
    let started = wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::SessionStarted { .. })
    })
    .await;
    assert!(matches!(
        started,
        SyncEvent::SessionStarted {
            bootstrap: Some(BootstrapReason::GapDetected),
            ..
        }
    ));
}

#[tokio::test]
async fn load_older_pages_from_the_store_then_falls_back_to_the_cloud() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, bob_cipher) = paired_ciphers(&alice(), &bob());
    let channel = ChannelId::for_pair(&alice(), &bob());
    let config = SyncConfig {
        backfill_page_size: 10,
        ..test_config()
    };

    // 25 rows in the local store, 5 strictly older ones only on the relay.
    let store = open_store(&dir, "alice.db");
    for n in 0..25 {
        let id = Uuid::from_u128(100 + n as u128);
        store
            .insert_message_if_absent(&stored(
                &alice(),
                &channel,
                &bob(),
                &alice(),
                id,
                ts(10 + n),
                &format!("local {n}"),
            ))
            .expect("insert local row");
    }
    let newest = store
        .latest_message(&channel)
        .expect("latest")
        .expect("rows exist");
    store
        .mark_bootstrap_completed(
            &alice(),
            &channel,
            Some(&newest.cursor()),
            config.schema_version,
            &config.app_version,
        )
        .expect("settle sync state");
    let mut cloud_only = Vec::new();
    for n in 0..5 {
        let id = Uuid::from_u128(10 + n as u128);
        cloud_only.push(sealed(
            &bob_cipher,
            &bob(),
            &alice(),
            id,
            ts(1 + n),
            &format!("cloud {n}"),
        ));
    }
    transport.seed(&channel, cloud_only).await;

    let (service, mut events) = MessageSyncService::new(
        config,
        alice(),
        Some(store),
        Arc::new(transport),
        Box::new(alice_cipher),
    );
    service.start(bob()).await.expect("start");
    let started = wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::SessionStarted { .. })
    })
    .await;
    assert!(matches!(
        started,
        SyncEvent::SessionStarted { bootstrap: None, .. }
    ));
    assert_eq!(service.timeline_snapshot().await.len(), 10);

    // Pure store pages first.
    assert_eq!(service.load_older(10).await.expect("first page"), 10);
    assert_eq!(service.timeline_snapshot().await.len(), 20);

    // The next page exhausts local history and pulls the cloud remainder.
    assert_eq!(service.load_older(10).await.expect("second page"), 10);
    let snapshot = service.timeline_snapshot().await;
    assert_eq!(snapshot.len(), 30);
    assert_eq!(snapshot[0].message.value, "cloud 0");

    let inspect = open_store(&dir, "alice.db");
    assert_eq!(inspect.message_count(&channel).expect("count"), 30);
}

#[tokio::test]
async fn delete_channel_wipes_local_state_and_ends_the_session() {
    let dir = TempDir::new().expect("tempdir");
    let transport = MemoryTransport::new();
    let (alice_cipher, _bob_cipher) = paired_ciphers(&alice(), &bob());

    let (service, mut events) = MessageSyncService::new(
        test_config(),
        alice(),
        Some(open_store(&dir, "alice.db")),
        Arc::new(transport),
        Box::new(alice_cipher),
    );
    let channel = service.start(bob()).await.expect("start");
    service
        .send(PayloadKind::Text, "soon gone".to_string(), false)
        .await
        .expect("send");

    service.delete_channel().await.expect("delete");
    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::ChannelDeleted { .. })
    })
    .await;

    let inspect = open_store(&dir, "alice.db");
    assert_eq!(inspect.message_count(&channel).expect("count"), 0);
    assert!(inspect
        .get_sync_state(&alice(), &channel)
        .expect("read state")
        .is_none());

    let err = service
        .send(PayloadKind::Text, "too late".to_string(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, tandem_sync::SyncError::Policy(_)));
}
