//! A Stream owns a MessageStore and a DedupIndex, enforces subject
//! binding/retention/ingestion limits, and exposes ack-confirmed publish
//! (spec.md §4.3).

pub mod config;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::Utc;
use parking_lot::RwLock;

pub use config::{
    zero_time, DiscardPolicy, PubAck, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamState,
};

use crate::account::AccountResourceMgr;
use crate::consumer::config::ConsumerConfig;
use crate::consumer::Consumer;
use crate::dedup::DedupIndex;
use crate::error::{err, Result};
use crate::message::{Headers, Message};
use crate::store::{MessageStore, MemoryStore, FileStore};
use crate::subject;
use crate::transport::Transport;

const DEFAULT_DEDUP_WINDOW_MS: i64 = 2 * 60 * 1000;

/// An append-only, persisted message log bound to one or more subject
/// patterns, with its attached Consumers.
pub struct Stream {
    account: Arc<AccountResourceMgr>,
    transport: Arc<dyn Transport>,
    config: RwLock<StreamConfig>,
    store: Box<dyn MessageStore>,
    dedup: DedupIndex,
    created: chrono::DateTime<Utc>,
    consumers: RwLock<HashMap<String, Arc<Consumer>>>,
    deleted: AtomicBool,
    // Guards against concurrent config mutation racing a pending
    // multi-step update (maxMsgs/maxBytes lowering plus eviction).
    write_lock: StdRwLock<()>,
}

impl Stream {
    /// Opens a Stream for `config`, backed by a fresh MemoryStore or
    /// FileStore under `data_root` according to `config.storage`.
    pub fn create(
        config: StreamConfig,
        account: Arc<AccountResourceMgr>,
        transport: Arc<dyn Transport>,
        data_root: Option<&std::path::Path>,
    ) -> Result<Arc<Stream>> {
        let mut config = config;
        validate_new_config(&config)?;
        if config.subjects.is_empty() {
            config.subjects.push(config.name.clone());
        }

        let store: Box<dyn MessageStore> = match config.storage {
            StorageType::Memory => Box::new(MemoryStore::new()),
            StorageType::File => {
                let root = data_root.ok_or_else(|| {
                    err!(StreamConfigInvalid, "file storage requires a data root")
                })?;
                Box::new(FileStore::open(root.join(&config.name))?)
            }
        };

        account.reserve_stream()?;
        let stream = Arc::new(Stream {
            account,
            transport,
            config: RwLock::new(config),
            store,
            dedup: DedupIndex::new(),
            created: Utc::now(),
            consumers: RwLock::new(HashMap::new()),
            deleted: AtomicBool::new(false),
            write_lock: StdRwLock::new(()),
        });
        Ok(stream)
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn config(&self) -> StreamConfig {
        self.config.read().clone()
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.config.read().retention
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config(),
            created: self.created,
            state: self.state(),
        }
    }

    pub fn state(&self) -> StreamState {
        let s = self.store.state();
        let (first_time, last_time) = if s.first_seq > s.last_seq {
            (config::zero_time(), config::zero_time())
        } else {
            let first = self.store.get(s.first_seq).map(|m| m.timestamp).unwrap_or_else(|_| config::zero_time());
            let last = if s.last_seq == s.first_seq {
                first
            } else {
                self.store.get(s.last_seq).map(|m| m.timestamp).unwrap_or_else(|_| config::zero_time())
            };
            (first, last)
        };
        StreamState {
            msgs: s.msgs,
            bytes: s.bytes,
            first_seq: s.first_seq,
            last_seq: s.last_seq,
            first_time,
            last_time,
            consumer_count: self.consumers.read().len(),
            num_deleted: s.num_deleted,
        }
    }

    fn dedup_window_ms(&self) -> i64 {
        let w = self.config.read().duplicate_window;
        if w <= 0 {
            DEFAULT_DEDUP_WINDOW_MS
        } else {
            w
        }
    }

    /// Ingests a publish, applying dedup, limits, and account accounting,
    /// and sends the `+OK`/`-ERR` reply on `reply_to` (unless suppressed
    /// by `no_ack`), per spec.md §4.3.
    pub fn ingest(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
        reply_to: Option<&str>,
        msg_id: Option<&str>,
    ) -> Result<PubAck> {
        let result = self.do_ingest(subject, headers, payload, msg_id);
        let no_ack = self.config.read().no_ack;
        match (&result, reply_to) {
            (Ok(ack), Some(reply)) if !no_ack => {
                let body = format!("+OK {}", serde_json::to_string(ack).unwrap_or_default());
                self.transport.publish(reply, None, &Headers::new(), body.as_bytes());
            }
            (Err(e), Some(reply)) => {
                self.transport.publish(reply, None, &Headers::new(), e.as_pub_reject().as_bytes());
            }
            _ => {}
        }
        result
    }

    fn do_ingest(&self, subject: &str, headers: Headers, payload: Vec<u8>, msg_id: Option<&str>) -> Result<PubAck> {
        let _guard = self.write_lock.write().unwrap();
        let cfg = self.config.read().clone();

        if !subject::matches_any(subject, &cfg.subjects) {
            return Err(err!(SubjectInvalid, "no matching subject filter for '{}'", subject));
        }

        if let Some(id) = msg_id {
            self.dedup.evict_older_than(Utc::now() - chrono::Duration::milliseconds(self.dedup_window_ms()));
            if let Some(seq) = self.dedup.check(id) {
                return Ok(PubAck { stream: cfg.name, seq, duplicate: true });
            }
        }

        let msg_size = payload.len() as i64 + headers.encoded_len() as i64;
        if cfg.max_msg_size >= 0 && msg_size > cfg.max_msg_size {
            return Err(err!(MessageTooLarge, "message size exceeds maximum allowed"));
        }

        loop {
            let state = self.store.state();
            let over_msgs = cfg.max_msgs >= 0 && (state.msgs + 1) as i64 > cfg.max_msgs;
            let over_bytes = cfg.max_bytes >= 0 && (state.bytes as i64 + msg_size) > cfg.max_bytes;
            if !over_msgs && !over_bytes {
                break;
            }
            match cfg.discard {
                DiscardPolicy::New => {
                    if over_msgs {
                        return Err(err!(MaxMessagesExceeded, "maximum messages exceeded"));
                    }
                    return Err(err!(MaxBytesExceeded, "maximum bytes exceeded"));
                }
                DiscardPolicy::Old => {
                    let evicted = self.store.evict_to_limits(
                        if over_msgs { cfg.max_msgs } else { -1 },
                        if over_bytes { cfg.max_bytes } else { -1 },
                        -1,
                        &|_| true,
                    )?;
                    if evicted.is_empty() {
                        if over_msgs {
                            return Err(err!(MaxMessagesExceeded, "maximum messages exceeded"));
                        }
                        return Err(err!(MaxBytesExceeded, "maximum bytes exceeded"));
                    }
                }
            }
        }

        self.account.reserve_bytes(cfg.storage, msg_size)?;

        let seq = match self.store.append(subject, headers, payload, Utc::now()) {
            Ok(seq) => seq,
            Err(e) => {
                self.account.release_bytes(cfg.storage, msg_size);
                return Err(e);
            }
        };

        if let Some(id) = msg_id {
            self.dedup.record(id.to_string(), seq, Utc::now());
        }

        log::debug!("stream {}: ingested seq {}", cfg.name, seq);
        self.notify_consumers_new_seq();

        Ok(PubAck { stream: cfg.name, seq, duplicate: false })
    }

    fn notify_consumers_new_seq(&self) {
        for consumer in self.consumers.read().values() {
            consumer.notify_new_seq();
        }
    }

    pub(crate) fn get_msg(&self, seq: u64) -> Result<Message> {
        self.store.get(seq)
    }

    pub(crate) fn scan_from(&self, seq: u64) -> Result<Vec<Message>> {
        self.store.scan_from(seq)
    }

    pub fn delete_msg(&self, seq: u64) -> Result<bool> {
        self.store.delete_msg(seq)
    }

    pub fn purge(&self) -> Result<u64> {
        let _guard = self.write_lock.write().unwrap();
        self.store.purge()
    }

    pub fn delete(self: &Arc<Stream>) {
        self.deleted.store(true, Ordering::SeqCst);
        let consumers: Vec<Arc<Consumer>> = self.consumers.write().drain().map(|(_, c)| c).collect();
        for c in consumers {
            c.shutdown();
            self.account.release_consumer();
        }
        self.account.release_stream();
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Mutates the Stream's config. Only `subjects`, the Limits-compatible
    /// caps, `no_ack`, and `duplicate_window` may change (spec.md §4.3).
    pub fn update(&self, new_config: StreamConfig) -> Result<()> {
        let _guard = self.write_lock.write().unwrap();
        let current = self.config.read().clone();
        if new_config.name != current.name {
            return Err(err!(StreamConfigInvalid, "can not change stream name"));
        }
        if new_config.storage != current.storage {
            return Err(err!(StreamConfigInvalid, "can not change storage type"));
        }
        if new_config.retention != current.retention {
            return Err(err!(StreamConfigInvalid, "can not change retention policy"));
        }
        if new_config.num_replicas != current.num_replicas {
            return Err(err!(StreamConfigInvalid, "can not change replicas"));
        }
        if new_config.template_owner != current.template_owner {
            return Err(err!(StreamConfigInvalid, "can not change template owner"));
        }
        if new_config.max_consumers != current.max_consumers {
            return Err(err!(StreamConfigInvalid, "can not change max consumers"));
        }
        for s in &new_config.subjects {
            subject::validate_pattern(s)?;
            if subject::overlaps_management_namespace(s) {
                return Err(err!(SubjectsOverlap, "subject '{}' overlaps the management namespace", s));
            }
        }

        // A subject-set update can't itself make two existing filtered
        // consumers' patterns overlap (patterns_overlap doesn't consult
        // the stream's subjects), but re-running the WorkQueue
        // partition check here keeps the invariant enforced at every
        // point it could in principle be violated (spec.md §9).
        if new_config.retention == RetentionPolicy::WorkQueue {
            let consumers = self.consumers.read();
            for existing in consumers.values() {
                let filter = existing.config().filter_subject;
                if let Some(filter) = &filter {
                    if !new_config.subjects.iter().any(|s| subject::patterns_overlap(s, filter)) {
                        return Err(err!(ConsumerConfigInvalid, "consumer '{}' filter is no longer a subset of the stream's subjects", existing.name()));
                    }
                }
            }
            for (i, a) in consumers.values().enumerate() {
                for b in consumers.values().skip(i + 1) {
                    match (&a.config().filter_subject, &b.config().filter_subject) {
                        (Some(fa), Some(fb)) if subject::patterns_overlap(fa, fb) => {
                            return Err(err!(ConsumerConfigInvalid, "work queue consumer filters must be disjoint"));
                        }
                        _ => {}
                    }
                }
            }
        }

        let lowering_msgs = new_config.max_msgs >= 0 && (current.max_msgs < 0 || new_config.max_msgs < current.max_msgs);
        let lowering_bytes = new_config.max_bytes >= 0 && (current.max_bytes < 0 || new_config.max_bytes < current.max_bytes);

        *self.config.write() = new_config.clone();

        if lowering_msgs || lowering_bytes {
            self.store.evict_to_limits(new_config.max_msgs, new_config.max_bytes, new_config.max_age, &|_| true)?;
        }
        Ok(())
    }

    /// Validates and installs a new Consumer, or returns the existing one
    /// if the request is byte-identical to an already-registered durable
    /// (idempotence, spec.md §3/§4.3).
    pub fn add_consumer(self: &Arc<Stream>, mut cfg: ConsumerConfig, client_has_interest: bool) -> Result<Arc<Consumer>> {
        let _guard = self.write_lock.write().unwrap();
        let stream_cfg = self.config.read().clone();

        if let Some(durable) = &cfg.durable_name {
            let consumers = self.consumers.read();
            if let Some(existing) = consumers.get(durable) {
                if existing.config() == cfg {
                    return Ok(existing.clone());
                }
                if existing.config_ignoring_deliver_subject_eq(&cfg) {
                    drop(consumers);
                    existing.update_deliver_subject(cfg.deliver_subject.clone())?;
                    return Ok(existing.clone());
                }
                return Err(err!(StreamAlreadyExists, "consumer '{}' already exists with a different configuration", durable));
            }
        }

        if let Some(filter) = &cfg.filter_subject {
            subject::validate_pattern(filter)?;
            if !stream_cfg.subjects.iter().any(|s| subject::patterns_overlap(s, filter)) {
                return Err(err!(ConsumerConfigInvalid, "filter subject is not a subset of the stream's subjects"));
            }
        }
        if cfg.opt_start_seq.is_some() && cfg.opt_start_time.is_some() {
            return Err(err!(ConsumerConfigInvalid, "opt_start_seq and opt_start_time are mutually exclusive"));
        }

        let ephemeral = cfg.durable_name.is_none();
        if let Some(deliver_subject) = &cfg.deliver_subject {
            if !subject::is_valid_literal_subject(deliver_subject) {
                return Err(err!(ConsumerConfigInvalid, "delivery subject must be a literal subject"));
            }
            if stream_cfg.subjects.iter().any(|s| subject::patterns_overlap(s, deliver_subject)) {
                return Err(err!(ConsumerConfigInvalid, "delivery subject would create a delivery cycle"));
            }
            if ephemeral && !client_has_interest {
                return Err(err!(DeliverSubjectNotInterest, "no subscriber interest on delivery subject"));
            }
        } else {
            // Pull.
            if cfg.ack_policy != crate::consumer::config::AckPolicy::Explicit {
                return Err(err!(ConsumerConfigInvalid, "pull consumers require explicit ack"));
            }
            if ephemeral {
                return Err(err!(ConsumerConfigInvalid, "pull consumers must be durable"));
            }
            if cfg.rate_limit.is_some() {
                return Err(err!(ConsumerConfigInvalid, "rate limit is not supported for pull consumers"));
            }
        }

        if cfg.filter_subject.is_some() && cfg.ack_policy == crate::consumer::config::AckPolicy::All && cfg.deliver_subject.is_some() {
            return Err(err!(ConsumerConfigInvalid, "filtered push consumers cannot use AckAll"));
        }

        if stream_cfg.max_consumers >= 0 && self.consumers.read().len() as i64 >= stream_cfg.max_consumers {
            return Err(err!(MaxConsumersExceeded, "maximum consumers exceeded"));
        }

        match stream_cfg.retention {
            RetentionPolicy::WorkQueue => {
                if !matches!(cfg.deliver_policy, crate::consumer::config::DeliverPolicy::All) {
                    return Err(err!(ConsumerConfigInvalid, "work queue streams only permit DeliverAll consumers"));
                }
                let consumers = self.consumers.read();
                for existing in consumers.values() {
                    let existing_cfg = existing.config();
                    match (&existing_cfg.filter_subject, &cfg.filter_subject) {
                        (None, _) | (_, None) => {
                            return Err(err!(ConsumerConfigInvalid, "work queue stream permits only one catch-all or a partitioned set of filtered consumers"));
                        }
                        (Some(a), Some(b)) => {
                            if subject::patterns_overlap(a, b) {
                                return Err(err!(ConsumerConfigInvalid, "work queue consumer filters must be disjoint"));
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        self.account.reserve_consumer()?;

        let name = cfg
            .durable_name
            .clone()
            .unwrap_or_else(crate::consumer::random_ephemeral_name);
        cfg.durable_name = if ephemeral { None } else { Some(name.clone()) };

        let start_floor = self.resolve_start_floor(&cfg);
        let consumer = Consumer::new(self, stream_cfg.name.clone(), name.clone(), cfg, self.transport.clone(), ephemeral, start_floor);
        self.consumers.write().insert(name, consumer.clone());
        consumer.notify_new_seq();
        Ok(consumer)
    }

    fn resolve_start_floor(&self, cfg: &ConsumerConfig) -> u64 {
        use crate::consumer::config::DeliverPolicy;
        match cfg.deliver_policy {
            DeliverPolicy::All => self.store.first_seq().saturating_sub(1),
            // With a filter attached, "last" means the last message
            // matching that filter, not the stream's unfiltered tail
            // (otherwise a filtered consumer could start past every
            // message it would ever have delivered).
            DeliverPolicy::Last => match &cfg.filter_subject {
                Some(filter) => self
                    .last_matching_seq(filter)
                    .map(|s| s.saturating_sub(1))
                    .unwrap_or_else(|| self.store.last_seq()),
                None => self.store.last_seq().saturating_sub(1),
            },
            DeliverPolicy::New => self.store.last_seq(),
            DeliverPolicy::ByStartSequence => cfg.opt_start_seq.unwrap_or(1).saturating_sub(1),
            DeliverPolicy::ByStartTime => {
                if let Some(t) = cfg.opt_start_time {
                    self.store
                        .scan_from_time(t)
                        .ok()
                        .and_then(|msgs| msgs.first().map(|m| m.seq.saturating_sub(1)))
                        .unwrap_or(self.store.last_seq())
                } else {
                    self.store.last_seq()
                }
            }
        }
    }

    /// The highest sequence whose subject matches `filter`, scanning
    /// backward from the stream's tail. Used to resolve `DeliverLast`
    /// for filtered Consumers.
    fn last_matching_seq(&self, filter: &str) -> Option<u64> {
        let first = self.store.first_seq();
        let last = self.store.last_seq();
        if last < first {
            return None;
        }
        for seq in (first..=last).rev() {
            if let Ok(msg) = self.store.get(seq) {
                if subject::subject_matches_pattern(&msg.subject, filter) {
                    return Some(seq);
                }
            }
        }
        None
    }

    pub fn get_consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.read().get(name).cloned()
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.read().keys().cloned().collect()
    }

    pub fn delete_consumer(&self, name: &str) -> Result<()> {
        let consumer = self
            .consumers
            .write()
            .remove(name)
            .ok_or_else(|| err!(ConsumerNotFound, "consumer '{}' not found", name))?;
        consumer.shutdown();
        self.account.release_consumer();
        Ok(())
    }

    /// Called internally by a Consumer's worker thread when its
    /// ephemeral inactivity threshold has elapsed.
    pub(crate) fn remove_consumer_internal(&self, name: &str) {
        if let Some(c) = self.consumers.write().remove(name) {
            self.account.release_consumer();
            drop(c);
        }
    }

    /// Called whenever a Consumer's ack floor advances, driving
    /// Interest/WorkQueue retention (spec.md §4.1, §4.4).
    pub(crate) fn on_consumer_ack_floor_advanced(&self, consumer_name: &str, acked_stream_seq: u64) {
        let retention = self.retention();
        match retention {
            RetentionPolicy::WorkQueue => {
                let _ = self.store.delete_msg(acked_stream_seq);
            }
            RetentionPolicy::Interest => {
                let _ = consumer_name;
                self.run_interest_retention();
            }
            RetentionPolicy::Limits => {}
        }
    }

    fn run_interest_retention(&self) {
        let cfg = self.config();
        let consumers = self.consumers.read();
        let retain = |seq: u64| consumers.values().all(|c| c.ack_floor_stream_seq() >= seq);
        let _ = self.store.evict_to_limits(cfg.max_msgs, cfg.max_bytes, cfg.max_age, &retain);
    }

    /// Runs age/size-driven retention eviction; intended to be called on
    /// a wall-clock tick (spec.md §4.1).
    pub fn run_retention_tick(&self) {
        let cfg = self.config();
        match cfg.retention {
            RetentionPolicy::Limits | RetentionPolicy::WorkQueue => {
                let _ = self.store.evict_to_limits(cfg.max_msgs, cfg.max_bytes, cfg.max_age, &|_| true);
            }
            RetentionPolicy::Interest => self.run_interest_retention(),
        }
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    /// Every live message in seq order, for the SnapshotEngine (spec.md
    /// §4.5).
    pub(crate) fn snapshot_messages(&self) -> Result<Vec<Message>> {
        self.store.snapshot_messages()
    }

    /// Replays a snapshot's message stream into this (freshly created,
    /// empty) Stream, preserving original sequence numbers.
    pub(crate) fn restore_messages(&self, messages: Vec<Message>) -> Result<()> {
        self.store.restore_messages(messages)
    }

    /// Every durable Consumer's delivery state, for inclusion in a
    /// snapshot. Ephemeral Consumers are not part of recoverable state
    /// (spec.md §6: they don't survive a restart either).
    pub(crate) fn export_consumer_snapshots(&self) -> Vec<crate::consumer::ConsumerSnapshot> {
        self.consumers
            .read()
            .values()
            .filter(|c| !c.is_ephemeral())
            .map(|c| c.export_snapshot())
            .collect()
    }

    /// Recreates a durable Consumer from a snapshot and reinstates its
    /// delivery/ack state, used by restore.
    pub(crate) fn restore_consumer_from_snapshot(
        self: &Arc<Stream>,
        snap: crate::consumer::ConsumerSnapshot,
    ) -> Result<()> {
        let consumer = self.add_consumer(snap.config.clone(), true)?;
        consumer.restore_snapshot(&snap);
        Ok(())
    }
}

fn validate_new_config(cfg: &StreamConfig) -> Result<()> {
    if cfg.name.is_empty() || cfg.name.contains('.') || cfg.name.contains('*') || cfg.name.contains('>') {
        return Err(err!(StreamNameInvalid, "invalid stream name '{}'", cfg.name));
    }
    for s in &cfg.subjects {
        subject::validate_pattern(s)?;
        if subject::overlaps_management_namespace(s) {
            return Err(err!(SubjectsOverlap, "subject '{}' overlaps the management namespace", s));
        }
    }
    if cfg.duplicate_window > 0 && cfg.max_age >= 0 && cfg.duplicate_window > cfg.max_age {
        return Err(err!(StreamConfigInvalid, "dedup window must not exceed max_age"));
    }
    if cfg.num_replicas != 1 {
        return Err(err!(StreamConfigInvalid, "replicas must be 1"));
    }
    Ok(())
}
