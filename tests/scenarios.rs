//! End-to-end scenarios from the functional specification, driven
//! directly against the core (no live pub/sub transport): request/reply
//! is simulated by calling `Account::ingest`/`Account::handle_request`
//! and inspecting the [`RecordingTransport`]'s captured publishes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use streamcore::account::AccountLimits;
use streamcore::consumer::{AckKind, AckPolicy, DeliverPolicy, ReplayPolicy};
use streamcore::error::ErrorKind;
use streamcore::snapshot::SnapshotEngine;
use streamcore::stream::{DiscardPolicy, RetentionPolicy, StorageType};
use streamcore::transport::RecordingTransport;
use streamcore::{Account, ConsumerConfig, Headers, StreamConfig};

fn mk_account() -> (Account, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let account = Account::new("acct1".to_string(), AccountLimits::unlimited(), transport.clone(), None);
    (account, transport)
}

/// Polls `transport.published()` until it has grown past `prev_count`
/// entries, then returns the new entry's reply token. Delivery runs on a
/// Consumer's background worker thread, so this is the test's
/// synchronization point with it.
fn wait_for_delivery(transport: &RecordingTransport, prev_count: usize) -> (String, Vec<u8>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let published = transport.published();
        if published.len() > prev_count {
            let entry = &published[prev_count];
            return (entry.reply.clone().expect("delivery publish carries a reply token"), entry.payload.clone());
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for delivery #{}", prev_count);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Parses `(deliveryCount, streamSeq, consumerSeq)` out of a delivery
/// reply token of the form
/// `$STREAM.ACK.<stream>.<consumer>.<deliveryCount>.<streamSeq>.<consumerSeq>.<timestamp>.<numPending>`.
fn parse_token(token: &str) -> (u64, u64, u64) {
    let parts: Vec<&str> = token.split('.').collect();
    assert_eq!(parts[0], "$STREAM");
    assert_eq!(parts[1], "ACK");
    let delivery_count: u64 = parts[4].parse().unwrap();
    let stream_seq: u64 = parts[5].parse().unwrap();
    let consumer_seq: u64 = parts[6].parse().unwrap();
    (delivery_count, stream_seq, consumer_seq)
}

/// Scenario 1 (spec.md §8): 1000 publishes to a memory stream each get a
/// pubAck `{stream, seq, duplicate:false}` in publish order, and the
/// stream's message count matches.
#[test]
fn basic_ack_publish() {
    let (account, _transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "foo".to_string(),
            subjects: vec!["foo".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();

    for i in 1..=1000u64 {
        let ack = account.ingest("foo", Headers::new(), b"HELLO".to_vec(), None, None).unwrap();
        assert_eq!(ack.stream, "foo");
        assert_eq!(ack.seq, i);
        assert!(!ack.duplicate);
    }

    let stream = account.get_stream("foo").unwrap();
    assert_eq!(stream.state().msgs, 1000);
}

/// Scenario 2 (spec.md §8): DiscardNew rejects the 11th message once
/// `maxMsgs=10`, and rejects an over-sized message once `maxBytes` is
/// lowered below it, each with the exact `-ERR` reason spec.md names.
#[test]
fn discard_new_limits() {
    let (account, transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "LIMITED".to_string(),
            subjects: vec!["LIMITED".to_string()],
            storage: StorageType::Memory,
            max_msgs: 10,
            discard: DiscardPolicy::New,
            ..Default::default()
        })
        .unwrap();

    for _ in 0..10 {
        account.ingest("LIMITED", Headers::new(), b"x".to_vec(), None, None).unwrap();
    }
    let err = account.ingest("LIMITED", Headers::new(), b"x".to_vec(), None, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MaxMessagesExceeded);
    assert_eq!(err.as_pub_reject(), "-ERR 'maximum messages exceeded'");

    account.purge_stream("LIMITED").unwrap();

    let stream = account.get_stream("LIMITED").unwrap();
    let mut cfg = stream.config();
    cfg.max_msgs = -1;
    cfg.max_bytes = 4096;
    account.update_stream("LIMITED", cfg).unwrap();

    let count_before = transport.published().len();
    let reply = "LIMITED.reply";
    let result = account.ingest("LIMITED", Headers::new(), vec![0u8; 8192], Some(reply), None);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::MaxBytesExceeded);
    let published = transport.published();
    assert_eq!(published.len(), count_before + 1);
    assert_eq!(published[count_before].subject, reply);
    assert_eq!(
        std::str::from_utf8(&published[count_before].payload).unwrap(),
        "-ERR 'maximum bytes exceeded'"
    );
}

/// spec.md §3: `firstTime`/`lastTime` are zero on an empty stream, track
/// the head/tail message timestamps once populated, and zero again after
/// a purge.
#[test]
fn stream_state_tracks_first_last_time() {
    let (account, _transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "TIMES".to_string(),
            subjects: vec!["TIMES".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
    let stream = account.get_stream("TIMES").unwrap();

    let empty = stream.state();
    assert_eq!(empty.first_time, streamcore::stream::zero_time());
    assert_eq!(empty.last_time, streamcore::stream::zero_time());

    account.ingest("TIMES", Headers::new(), b"one".to_vec(), None, None).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    account.ingest("TIMES", Headers::new(), b"two".to_vec(), None, None).unwrap();

    let populated = stream.state();
    assert!(populated.first_time <= populated.last_time);
    assert_ne!(populated.first_time, streamcore::stream::zero_time());

    account.purge_stream("TIMES").unwrap();
    let purged = stream.state();
    assert_eq!(purged.first_time, streamcore::stream::zero_time());
    assert_eq!(purged.last_time, streamcore::stream::zero_time());
}

/// Scenario 3 (spec.md §8): a WorkQueue stream's pull consumer redelivers
/// a NAK'd message with a fresh `consumerSeq` while later sequences keep
/// advancing normally.
#[test]
fn workqueue_nak_redelivery() {
    let (account, transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "MY_WQ".to_string(),
            subjects: vec!["MY_WQ".to_string()],
            storage: StorageType::Memory,
            retention: RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .unwrap();
    for i in 0..10u8 {
        account.ingest("MY_WQ", Headers::new(), vec![i], None, None).unwrap();
    }

    let consumer = account
        .add_consumer(
            "MY_WQ",
            ConsumerConfig {
                durable_name: Some("workers".to_string()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: Some(60_000),
                ..Default::default()
            },
            true,
        )
        .unwrap();

    let mut delivered = 0usize;
    let mut tokens = Vec::new();
    for _ in 0..6 {
        consumer.pull("wq.inbox", 1, None).unwrap();
        let (token, _payload) = wait_for_delivery(&transport, delivered);
        delivered += 1;
        tokens.push(token);
    }

    // Deliveries 1-5 (stream_seq 1..=5) positive-ack; delivery 6 (stream_seq 6) NAKs.
    for token in &tokens[0..5] {
        let (_, stream_seq, _) = parse_token(token);
        assert!((1..=5).contains(&stream_seq));
        consumer.handle_ack(token, AckKind::Ack, None).unwrap();
    }
    let (delivery_count, stream_seq, _) = parse_token(&tokens[5]);
    assert_eq!(stream_seq, 6);
    assert_eq!(delivery_count, 1);
    consumer.handle_ack(&tokens[5], AckKind::Nak, None).unwrap();

    // Next pull redelivers stream_seq=6 with a fresh consumer_seq=7.
    consumer.pull("wq.inbox", 1, None).unwrap();
    let (token, _) = wait_for_delivery(&transport, delivered);
    delivered += 1;
    let (delivery_count, stream_seq, consumer_seq) = parse_token(&token);
    assert_eq!(stream_seq, 6);
    assert_eq!(consumer_seq, 7);
    assert_eq!(delivery_count, 2);
    consumer.handle_ack(&token, AckKind::Ack, None).unwrap();

    for (expected_seq, expected_consumer_seq) in (7..=10u64).zip(8..=11u64) {
        consumer.pull("wq.inbox", 1, None).unwrap();
        let (token, _) = wait_for_delivery(&transport, delivered);
        delivered += 1;
        let (_, stream_seq, consumer_seq) = parse_token(&token);
        assert_eq!(stream_seq, expected_seq);
        assert_eq!(consumer_seq, expected_consumer_seq);
        consumer.handle_ack(&token, AckKind::Ack, None).unwrap();
    }
}

/// spec.md §4.4: `+NXT` is a positive ack that also enqueues a single pull
/// waiter on the inbox the ack itself carried as its reply-to, so a pull
/// consumer can ack-and-fetch in one round trip instead of two.
#[test]
fn nxt_ack_enqueues_next_pull() {
    let (account, transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "MY_WQ2".to_string(),
            subjects: vec!["MY_WQ2".to_string()],
            storage: StorageType::Memory,
            retention: RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .unwrap();
    for i in 0..3u8 {
        account.ingest("MY_WQ2", Headers::new(), vec![i], None, None).unwrap();
    }

    let consumer = account
        .add_consumer(
            "MY_WQ2",
            ConsumerConfig {
                durable_name: Some("workers2".to_string()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: Some(60_000),
                ..Default::default()
            },
            true,
        )
        .unwrap();

    consumer.pull("wq2.inbox", 1, None).unwrap();
    let (token, _) = wait_for_delivery(&transport, 0);
    let (_, stream_seq, _) = parse_token(&token);
    assert_eq!(stream_seq, 1);

    // +NXT should ack stream_seq=1 and enqueue a pull waiter on the ack's
    // own reply-to, delivering stream_seq=2 without a second explicit pull.
    consumer.handle_ack(&token, AckKind::Next(Some(1)), Some("wq2.inbox")).unwrap();
    let (next_token, _) = wait_for_delivery(&transport, 1);
    let (_, next_stream_seq, _) = parse_token(&next_token);
    assert_eq!(next_stream_seq, 2);
}

/// Scenario 4 (spec.md §8): republishing within the dedup window resolves
/// to the original sequence and is marked duplicate; the window decays
/// once enough time has passed.
#[test]
fn dedup_window_resolves_and_decays() {
    let (account, _transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "DEDUP".to_string(),
            subjects: vec!["DEDUP".to_string()],
            storage: StorageType::Memory,
            duplicate_window: 25,
            ..Default::default()
        })
        .unwrap();

    let ids = ["AA", "BB", "CC", "ZZ"];
    for (i, id) in ids.iter().enumerate() {
        let ack = account.ingest("DEDUP", Headers::new(), b"x".to_vec(), None, Some(id)).unwrap();
        assert_eq!(ack.seq, i as u64 + 1);
        assert!(!ack.duplicate);
    }

    for id in ["AA", "BB", "ZZ"] {
        let ack = account.ingest("DEDUP", Headers::new(), b"x".to_vec(), None, Some(id)).unwrap();
        assert!(ack.duplicate);
    }
    let stream = account.get_stream("DEDUP").unwrap();
    assert_eq!(stream.state().msgs, 4);
    assert_eq!(stream.dedup_len(), 4);

    std::thread::sleep(Duration::from_millis(50));

    for (i, id) in ["AAA", "BBB", "CCC", "YYY", "ZZZ"].iter().enumerate() {
        let ack = account.ingest("DEDUP", Headers::new(), b"y".to_vec(), None, Some(id)).unwrap();
        assert_eq!(ack.seq, 5 + i as u64);
        assert!(!ack.duplicate);
    }
    // Every ingest with a msg_id evicts entries older than the window
    // first; by the last of the five new ids, the original four are gone.
    assert!(stream.dedup_len() <= 5);

    std::thread::sleep(Duration::from_millis(50));
    let ack = account.ingest("DEDUP", Headers::new(), b"z".to_vec(), None, Some("DECAY")).unwrap();
    assert!(!ack.duplicate);
    assert_eq!(stream.dedup_len(), 1);
}

/// Scenario 5 (spec.md §8): a filtered, durable push consumer with
/// `deliverPolicy=Last` starts at the last matching message, acks evens,
/// and sees odds redelivered with an incrementing delivery count while
/// `consumerSeq` keeps climbing.
#[test]
fn filtered_push_redelivery() {
    let (account, transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "FOO".to_string(),
            subjects: vec!["foo.*".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
    for _ in 0..50 {
        account.ingest("foo.AA", Headers::new(), b"a".to_vec(), None, None).unwrap();
        account.ingest("foo.ZZ", Headers::new(), b"z".to_vec(), None, None).unwrap();
    }

    let consumer = account
        .add_consumer(
            "FOO",
            ConsumerConfig {
                durable_name: Some("aa-watcher".to_string()),
                deliver_subject: Some("push.inbox".to_string()),
                filter_subject: Some("foo.AA".to_string()),
                deliver_policy: DeliverPolicy::Last,
                ack_policy: AckPolicy::Explicit,
                ack_wait: Some(100),
                replay_policy: ReplayPolicy::Instant,
                ..Default::default()
            },
            true,
        )
        .unwrap();

    let (token, _) = wait_for_delivery(&transport, 0);
    let (_, stream_seq, consumer_seq) = parse_token(&token);
    // Every foo.AA publish lands on an odd stream_seq; the last one is 99.
    assert_eq!(stream_seq, 99);
    assert_eq!(consumer_seq, 1);
    consumer.handle_ack(&token, AckKind::Ack, None).unwrap();

    // No further foo.AA messages exist after the last one, so there is
    // nothing left to deliver or redeliver; the ack floor tracks the one
    // message this consumer ever saw.
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(consumer.ack_floor_stream_seq(), 99);

    // Re-run with DeliverAll so the even/odd ack-and-redeliver behavior
    // from the scenario is exercised over the full filtered history.
    let consumer = account
        .add_consumer(
            "FOO",
            ConsumerConfig {
                durable_name: Some("aa-all".to_string()),
                deliver_subject: Some("push.inbox.all".to_string()),
                filter_subject: Some("foo.AA".to_string()),
                deliver_policy: DeliverPolicy::All,
                ack_policy: AckPolicy::Explicit,
                ack_wait: Some(100),
                ..Default::default()
            },
            true,
        )
        .unwrap();

    let mut delivered = transport.published().len();
    let mut first_pass = Vec::new();
    for _ in 0..50 {
        let (token, _) = wait_for_delivery(&transport, delivered);
        delivered += 1;
        first_pass.push(token);
    }
    for (i, token) in first_pass.iter().enumerate() {
        let (delivery_count, _, consumer_seq) = parse_token(token);
        assert_eq!(delivery_count, 1);
        assert_eq!(consumer_seq, i as u64 + 1);
        if i % 2 == 0 {
            consumer.handle_ack(token, AckKind::Ack, None).unwrap();
        }
    }

    // The 25 odd-indexed (unacked) deliveries redeliver once their
    // ackWait elapses, each with deliveryCount>=2 and a fresh, still
    // strictly increasing consumerSeq.
    let mut last_consumer_seq = 50u64;
    let mut redelivered_count = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while redelivered_count < 25 && Instant::now() < deadline {
        let published = transport.published();
        if published.len() > delivered {
            for entry in &published[delivered..] {
                let token = entry.reply.clone().unwrap();
                let (delivery_count, _, consumer_seq) = parse_token(&token);
                assert!(delivery_count >= 2);
                assert!(consumer_seq > last_consumer_seq);
                last_consumer_seq = consumer_seq;
                consumer.handle_ack(&token, AckKind::Ack, None).unwrap();
                redelivered_count += 1;
            }
            delivered = published.len();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(redelivered_count, 25, "every unacked odd delivery should redeliver once");
}

/// Scenario 6 (spec.md §8): a stream's full state round-trips through the
/// chunked snapshot/restore protocol, and restoring over a live stream of
/// the same name is refused.
#[test]
fn snapshot_restore_round_trip() {
    let (account, transport) = mk_account();
    account
        .create_stream(StreamConfig {
            name: "MY-STREAM".to_string(),
            subjects: vec!["foo".to_string(), "bar".to_string(), "baz".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
    let subjects = ["foo", "bar", "baz"];
    for i in 0..100u32 {
        let subject = subjects[i as usize % subjects.len()];
        account
            .ingest(subject, Headers::new(), i.to_le_bytes().to_vec(), None, None)
            .unwrap();
    }

    let mut consumer_names = Vec::new();
    for (idx, prefix) in [10u64, 30, 60].iter().enumerate() {
        let name = format!("puller-{}", idx);
        let consumer = account
            .add_consumer(
                "MY-STREAM",
                ConsumerConfig {
                    durable_name: Some(name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Some(30_000),
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        let mut delivered = 0usize;
        for _ in 0..*prefix {
            consumer.pull(&format!("pull.{}", name), 1, None).unwrap();
            let (token, _) = wait_for_delivery(&transport, delivered);
            delivered += 1;
            consumer.handle_ack(&token, AckKind::Ack, None).unwrap();
        }
        consumer_names.push((name, *prefix));
    }

    let stream = account.get_stream("MY-STREAM").unwrap();
    let snapshot_transport = Arc::new(RecordingTransport::new());
    SnapshotEngine::send(&stream, &*snapshot_transport, "snap.inbox", None, || true).unwrap();
    let chunks: Vec<(Vec<u8>, Option<String>)> = snapshot_transport
        .published()
        .into_iter()
        .map(|p| (p.payload, Some("snap.reply".to_string())))
        .collect();

    // Restoring over the still-live original is refused.
    let err = account.begin_restore("MY-STREAM").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamAlreadyExists);

    account.delete_stream("MY-STREAM").unwrap();

    let info = account.complete_restore("MY-STREAM", &chunks).unwrap();
    assert_eq!(info.state.msgs, 100);
    assert_eq!(info.config.subjects.len(), 3);

    let restored = account.get_stream("MY-STREAM").unwrap();
    for (name, prefix) in consumer_names {
        let restored_consumer = restored.get_consumer(&name).unwrap();
        assert_eq!(restored_consumer.ack_floor_stream_seq(), prefix);
    }
}
