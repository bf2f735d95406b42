//! SnapshotEngine: streams a Stream's full recoverable state as a
//! chunked, flow-controlled byte sequence, and the inverse restore path
//! that reconstructs a Stream from those chunks (spec.md §4.5).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::account::AccountResourceMgr;
use crate::consumer::ConsumerSnapshot;
use crate::error::{err, Result};
use crate::message::{Headers, Message};
use crate::stream::{Stream, StreamConfig};
use crate::transport::Transport;

const DEFAULT_CHUNK_SIZE: usize = 128;

/// Stream config plus every durable Consumer's delivery state, carried
/// on the first chunk of a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotMeta {
    pub config: StreamConfig,
    pub consumers: Vec<ConsumerSnapshot>,
}

/// One unit of the wire protocol published to the snapshot's
/// `deliverSubject`. The metadata is only present on the first chunk.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotChunk {
    pub meta: Option<SnapshotMeta>,
    pub messages: Vec<Message>,
}

pub struct SnapshotEngine;

impl SnapshotEngine {
    /// Streams `stream`'s full state to `deliver_subject` in chunks of at
    /// most `chunk_size` messages. `await_ack` blocks until the
    /// previously published chunk's reply arrives (or returns `false` if
    /// the peer went away), matching spec.md §4.5's "next chunk is
    /// published only after the previous chunk's reply arrives". The
    /// final publish carries an empty payload (end-of-snapshot).
    pub fn send(
        stream: &Stream,
        transport: &dyn Transport,
        deliver_subject: &str,
        chunk_size: Option<usize>,
        mut await_ack: impl FnMut() -> bool,
    ) -> Result<()> {
        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let meta = SnapshotMeta {
            config: stream.config(),
            consumers: stream.export_consumer_snapshots(),
        };
        let messages = stream.snapshot_messages()?;

        let mut batches: Vec<&[Message]> = messages.chunks(chunk_size).collect();
        if batches.is_empty() {
            batches.push(&[]);
        }
        for (i, batch) in batches.into_iter().enumerate() {
            let chunk = SnapshotChunk {
                meta: if i == 0 { Some(meta.clone()) } else { None },
                messages: batch.to_vec(),
            };
            Self::publish_chunk(transport, deliver_subject, &chunk)?;
            if !await_ack() {
                return Err(err!(RestoreSubscriptionClosed, "peer closed the snapshot subscription"));
            }
        }

        transport.publish(deliver_subject, None, &Headers::new(), &[]);
        Ok(())
    }

    fn publish_chunk(transport: &dyn Transport, subject: &str, chunk: &SnapshotChunk) -> Result<()> {
        let body = serde_json::to_vec(chunk)?;
        transport.publish(subject, None, &Headers::new(), &body);
        Ok(())
    }

    /// Reconstructs a Stream from the chunk bodies collected on a
    /// restore subscription (the caller accumulates raw payloads and the
    /// reply subject observed with each, stopping at the first
    /// empty-payload terminator, then calls this once). Any non-terminal
    /// chunk published without a reply subject aborts the restore
    /// (spec.md §4.5).
    pub fn restore(
        target_name: &str,
        chunks: &[(Vec<u8>, Option<String>)],
        account: Arc<AccountResourceMgr>,
        transport: Arc<dyn Transport>,
        data_root: Option<&std::path::Path>,
        stream_exists: impl Fn(&str) -> bool,
    ) -> Result<Arc<Stream>> {
        if stream_exists(target_name) {
            return Err(err!(StreamAlreadyExists, "stream '{}' already exists", target_name));
        }

        let mut meta: Option<SnapshotMeta> = None;
        let mut messages = Vec::new();
        for (body, reply) in chunks {
            if body.is_empty() {
                break;
            }
            if reply.is_none() {
                return Err(err!(RestoreSubscriptionClosed, "restore chunk published without a reply subject"));
            }
            let chunk: SnapshotChunk = serde_json::from_slice(body)?;
            if let Some(m) = chunk.meta {
                meta = Some(m);
            }
            messages.extend(chunk.messages);
        }

        let mut meta = meta.ok_or_else(|| err!(StreamConfigInvalid, "restore contained no metadata chunk"))?;
        meta.config.name = target_name.to_string();

        let stream = Stream::create(meta.config, account, transport, data_root)?;
        stream.restore_messages(messages)?;
        for snap in meta.consumers {
            stream.restore_consumer_from_snapshot(snap)?;
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountLimits, AccountResourceMgr};
    use crate::message::Headers;
    use crate::stream::StreamConfig;
    use crate::transport::RecordingTransport;

    fn mk_account() -> Arc<AccountResourceMgr> {
        Arc::new(AccountResourceMgr::new(AccountLimits::unlimited()))
    }

    #[test]
    fn round_trips_config_messages_and_consumer_state() {
        let transport = Arc::new(RecordingTransport::new());
        let account = mk_account();
        let cfg = StreamConfig {
            name: "MY-STREAM".to_string(),
            subjects: vec!["foo".to_string()],
            storage: crate::stream::StorageType::Memory,
            ..Default::default()
        };
        let stream = Stream::create(cfg, account.clone(), transport.clone(), None).unwrap();
        for i in 0..10 {
            stream
                .ingest("foo", Headers::new(), vec![i as u8], None, None)
                .unwrap();
        }
        let consumer = stream
            .add_consumer(crate::consumer::ConsumerConfig::from("durable-1"), true)
            .unwrap();
        consumer.notify_new_seq();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut published = Vec::new();
        SnapshotEngine::send(&stream, &*transport, "snap.inbox", Some(4), || true).unwrap();
        for p in transport.drain() {
            published.push((p.payload, Some("reply.inbox".to_string())));
        }
        // Drop the trailing empty-payload terminator; restore() derives
        // its own from the first empty body it sees.
        assert!(published.last().map(|(b, _)| b.is_empty()).unwrap_or(false));

        let account2 = mk_account();
        let restored = SnapshotEngine::restore(
            "MY-STREAM-2",
            &published,
            account2,
            transport,
            None,
            |_| false,
        )
        .unwrap();

        assert_eq!(restored.state().msgs, 10);
        assert_eq!(restored.name(), "MY-STREAM-2");
        let restored_consumer = restored.get_consumer("durable-1").unwrap();
        assert_eq!(restored_consumer.ack_floor_stream_seq(), consumer.ack_floor_stream_seq());
    }

    #[test]
    fn restore_refuses_existing_name() {
        let transport = Arc::new(RecordingTransport::new());
        let account = mk_account();
        let err = SnapshotEngine::restore(
            "EXISTING",
            &[],
            account,
            transport,
            None,
            |name| name == "EXISTING",
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StreamAlreadyExists);
    }
}
