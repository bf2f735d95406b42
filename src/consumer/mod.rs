//! Consumer: a delivery state machine over a parent Stream (spec.md §4.4).
//!
//! Delivery and redelivery both run on a single background thread per
//! Consumer, so ack processing and delivery are naturally mutually
//! exclusive without an extra lock around the delivery loop itself.

pub mod config;
mod timer;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use config::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, ReplayPolicy, SequencePair};

use crate::error::{err, Result};
use crate::stream::Stream;
use crate::subject;
use crate::transport::Transport;
use timer::RedeliveryHeap;

const ACK_PREFIX: &str = "$STREAM.ACK";
const ADVISORY_TERMINATED_PREFIX: &str = "$STREAM.ADVISORY.TERMINATED";
const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(5);
const ORIGIN_SUBJECT_HEADER: &str = "Nats-Msg-Subject";

/// Published on `$STREAM.ADVISORY.TERMINATED.<stream>.<consumer>` whenever
/// a pending message is TERM'd (spec.md §4.4).
#[derive(Debug, Serialize)]
struct TerminatedAdvisory {
    stream: String,
    consumer: String,
    stream_seq: u64,
    consumer_seq: u64,
    deliveries: u64,
    reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LifecycleState {
    Registered = 0,
    Active = 1,
    Inactive = 2,
    Deleted = 3,
}

struct PendingEntry {
    delivered_at: Instant,
    delivery_count: u64,
}

/// The portion of a Consumer's state carried in a Stream snapshot
/// (spec.md §4.5). `pending` is `(streamSeq, deliveryCount)` pairs only;
/// redelivery deadlines are not part of the wire form.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsumerSnapshot {
    pub name: String,
    pub config: ConsumerConfig,
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    pub pending: Vec<(u64, u64)>,
}

struct PullWaiter {
    reply_inbox: String,
    batch_remaining: u64,
    deadline: Option<Instant>,
}

/// What a client sent back on a delivery's reply token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nak,
    Wpi,
    /// An optional free-text reason, carried into the terminated-message
    /// advisory.
    Term(Option<String>),
    Next(Option<u64>),
}

impl AckKind {
    pub fn parse(body: &[u8]) -> AckKind {
        let body = std::str::from_utf8(body).unwrap_or("").trim();
        if body.is_empty() || body == "+ACK" {
            AckKind::Ack
        } else if body == "-NAK" {
            AckKind::Nak
        } else if body == "+WPI" {
            AckKind::Wpi
        } else if let Some(rest) = body.strip_prefix("+TERM") {
            let rest = rest.trim();
            AckKind::Term(if rest.is_empty() { None } else { Some(rest.to_string()) })
        } else if let Some(rest) = body.strip_prefix("+NXT") {
            let rest = rest.trim();
            AckKind::Next(rest.parse::<u64>().ok())
        } else {
            AckKind::Ack
        }
    }
}

struct TokenBucket {
    capacity_bytes: f64,
    tokens: f64,
    rate_bytes_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bits_per_sec: u64) -> TokenBucket {
        let rate = bits_per_sec as f64 / 8.0;
        TokenBucket {
            capacity_bytes: rate.max(1.0),
            tokens: rate.max(1.0),
            rate_bytes_per_sec: rate.max(1.0),
            last_refill: Instant::now(),
        }
    }

    /// Blocks the calling (delivery) thread until `bytes` worth of budget
    /// is available, then debits it.
    fn take(&mut self, bytes: usize) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec).min(self.capacity_bytes);
            self.last_refill = now;
            if self.tokens >= bytes as f64 {
                self.tokens -= bytes as f64;
                return;
            }
            let deficit = bytes as f64 - self.tokens;
            let wait = Duration::from_secs_f64((deficit / self.rate_bytes_per_sec).max(0.001));
            std::thread::sleep(wait.min(Duration::from_millis(50)));
        }
    }
}

struct Inner {
    config: ConsumerConfig,
    delivered: SequencePair,
    ack_floor: SequencePair,
    pending: BTreeMap<u64, PendingEntry>,
    redeliver_queue: VecDeque<u64>,
    waiters: VecDeque<PullWaiter>,
    next_scan_seq: u64,
    last_new_timestamp: Option<chrono::DateTime<Utc>>,
    redelivery: RedeliveryHeap,
}

/// A Consumer attached to one parent Stream. Holds a non-owning
/// [`Weak`] back-reference to the Stream (the Stream owns the Consumer
/// via `Arc`, per spec.md §9's cyclic-ownership note).
pub struct Consumer {
    stream: Weak<Stream>,
    stream_name: String,
    name: String,
    ephemeral: bool,
    transport: Arc<dyn Transport>,
    created: chrono::DateTime<Utc>,
    state: AtomicU8,
    deleted: AtomicBool,
    // Locked independently of `inner` so a throttled delivery doesn't
    // block ack processing on the same Consumer while it sleeps.
    rate_limiter: Mutex<Option<TokenBucket>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    inner: Mutex<Inner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

const NAME_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A random 6-character token used for ephemeral Consumer names
/// (spec.md §3), in the style of the teacher's `fastrand`-based
/// short-token generation.
pub fn random_ephemeral_name() -> String {
    (0..6)
        .map(|_| NAME_ALPHABET[fastrand::usize(0..NAME_ALPHABET.len())] as char)
        .collect()
}

impl Consumer {
    pub(crate) fn new(
        stream: &Arc<Stream>,
        stream_name: String,
        name: String,
        config: ConsumerConfig,
        transport: Arc<dyn Transport>,
        ephemeral: bool,
        start_floor: u64,
    ) -> Arc<Consumer> {
        let (wake_tx, wake_rx) = bounded(16);
        let rate_limiter = config.rate_limit.map(TokenBucket::new);
        let consumer = Arc::new(Consumer {
            stream: Arc::downgrade(stream),
            stream_name,
            name,
            ephemeral,
            transport,
            created: Utc::now(),
            state: AtomicU8::new(LifecycleState::Registered as u8),
            deleted: AtomicBool::new(false),
            rate_limiter: Mutex::new(rate_limiter),
            wake_tx,
            wake_rx,
            inner: Mutex::new(Inner {
                config,
                delivered: SequencePair { consumer_seq: 0, stream_seq: start_floor },
                ack_floor: SequencePair { consumer_seq: 0, stream_seq: start_floor },
                pending: BTreeMap::new(),
                redeliver_queue: VecDeque::new(),
                waiters: VecDeque::new(),
                next_scan_seq: start_floor + 1,
                last_new_timestamp: None,
                redelivery: RedeliveryHeap::new(),
            }),
            worker: Mutex::new(None),
        });

        let worker_handle = {
            let consumer = consumer.clone();
            std::thread::spawn(move || consumer.run_worker())
        };
        *consumer.worker.lock() = Some(worker_handle);
        consumer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn config(&self) -> ConsumerConfig {
        self.inner.lock().config.clone()
    }

    /// True if `other` is identical to this Consumer's config except
    /// possibly for `deliver_subject` (spec.md §3 idempotence rule).
    pub(crate) fn config_ignoring_deliver_subject_eq(&self, other: &ConsumerConfig) -> bool {
        let current = self.inner.lock().config.clone();
        ConsumerConfig { deliver_subject: None, ..current } == ConsumerConfig { deliver_subject: None, ..other.clone() }
    }

    /// Updates `deliver_subject` only; rejects if the Consumer is Active
    /// (spec.md §3: "only deliverSubject may be changed... while
    /// inactive").
    pub(crate) fn update_deliver_subject(&self, deliver_subject: Option<String>) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == LifecycleState::Active as u8 {
            return Err(err!(ConsumerConfigInvalid, "consumer is active, cannot change delivery subject"));
        }
        self.inner.lock().config.deliver_subject = deliver_subject;
        Ok(())
    }

    pub fn info(&self) -> ConsumerInfo {
        let inner = self.inner.lock();
        ConsumerInfo {
            stream_name: self.stream_name.clone(),
            name: self.name.clone(),
            created: self.created,
            config: inner.config.clone(),
            delivered: inner.delivered,
            ack_floor: inner.ack_floor,
            num_ack_pending: inner.pending.len(),
            num_redelivered: inner.pending.values().filter(|p| p.delivery_count > 1).count(),
            num_waiting: inner.waiters.len(),
            num_pending: self.num_pending_locked(&inner),
        }
    }

    fn num_pending_locked(&self, inner: &Inner) -> u64 {
        match self.stream.upgrade() {
            Some(stream) => stream.state().last_seq.saturating_sub(inner.delivered.stream_seq),
            None => 0,
        }
    }

    pub fn ack_floor_stream_seq(&self) -> u64 {
        self.inner.lock().ack_floor.stream_seq
    }

    /// Captures delivery/ack/pending state for inclusion in a Stream
    /// snapshot (spec.md §4.5). Redelivery timer deadlines are not
    /// preserved; on restore they're rescheduled `ackWait` from the
    /// restore instant, matching §4.4's "deliveryCount preserved" but not
    /// wall-clock-exact restart rule.
    pub(crate) fn export_snapshot(&self) -> ConsumerSnapshot {
        let inner = self.inner.lock();
        ConsumerSnapshot {
            name: self.name.clone(),
            config: inner.config.clone(),
            delivered: inner.delivered,
            ack_floor: inner.ack_floor,
            pending: inner
                .pending
                .iter()
                .map(|(seq, p)| (*seq, p.delivery_count))
                .collect(),
        }
    }

    /// Restores delivery/ack/pending state onto a just-created Consumer,
    /// rescheduling redelivery timers for any still-pending sequences.
    pub(crate) fn restore_snapshot(&self, snap: &ConsumerSnapshot) {
        let mut inner = self.inner.lock();
        inner.delivered = snap.delivered;
        inner.ack_floor = snap.ack_floor;
        inner.next_scan_seq = inner.next_scan_seq.max(snap.delivered.stream_seq + 1);
        let ack_wait = Duration::from_millis(inner.config.ack_wait_ms().max(0) as u64);
        for &(seq, delivery_count) in &snap.pending {
            inner.pending.insert(seq, PendingEntry { delivered_at: Instant::now(), delivery_count });
            inner.redelivery.schedule(seq, Instant::now() + ack_wait);
        }
    }

    /// Called by the parent Stream whenever a new sequence is appended.
    pub fn notify_new_seq(&self) {
        self.state.store(LifecycleState::Active as u8, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    /// Enqueues a pull request for `reply_inbox` with `batch` messages.
    pub fn pull(&self, reply_inbox: &str, batch: u64, deadline: Option<Instant>) -> Result<()> {
        if !self.inner.lock().config.is_pull() {
            return Err(err!(ConsumerConfigInvalid, "consumer is not a pull consumer"));
        }
        self.inner.lock().waiters.push_back(PullWaiter {
            reply_inbox: reply_inbox.to_string(),
            batch_remaining: batch.max(1),
            deadline,
        });
        self.state.store(LifecycleState::Active as u8, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        Ok(())
    }

    /// Drops every pull waiter belonging to a client connection that the
    /// transport has reported gone (spec.md §9 "Pull waiters across
    /// transport loss").
    pub fn drop_waiters_for(&self, reply_inbox_prefix: &str) {
        self.inner.lock().waiters.retain(|w| !w.reply_inbox.starts_with(reply_inbox_prefix));
    }

    /// Handles an ack body received on a delivery reply token. `reply_inbox`
    /// is the inbox the ack itself carried as its reply-to (the pull
    /// waiter's inbox for `+NXT`'s new pull request); it's ignored by every
    /// other `AckKind`.
    pub fn handle_ack(&self, token: &str, kind: AckKind, reply_inbox: Option<&str>) -> Result<()> {
        let parsed = parse_ack_token(token)
            .ok_or_else(|| err!(ConsumerConfigInvalid, "malformed ack token"))?;
        if parsed.stream != self.stream_name || parsed.consumer != self.name {
            return Err(err!(ConsumerConfigInvalid, "ack token does not match this consumer"));
        }
        match kind {
            AckKind::Ack => self.ack_positive(parsed.stream_seq, parsed.consumer_seq),
            AckKind::Nak => self.nak(parsed.stream_seq),
            AckKind::Wpi => self.wpi(parsed.stream_seq),
            AckKind::Term(reason) => self.term(parsed.stream_seq, parsed.consumer_seq, reason),
            AckKind::Next(batch) => {
                self.ack_positive(parsed.stream_seq, parsed.consumer_seq)?;
                let inbox = reply_inbox
                    .ok_or_else(|| err!(ConsumerConfigInvalid, "+NXT requires a reply inbox"))?;
                self.pull(inbox, batch.unwrap_or(1), None)
            }
        }
    }

    fn advance_ack_floor(inner: &mut Inner) {
        loop {
            let next = inner.ack_floor.stream_seq + 1;
            if inner.pending.contains_key(&next) {
                break;
            }
            if inner.delivered.stream_seq <= inner.ack_floor.stream_seq {
                break;
            }
            inner.ack_floor.stream_seq = next;
        }
        inner.ack_floor.consumer_seq = inner.delivered.consumer_seq
            - inner.pending.len() as u64
            - inner.redeliver_queue.len() as u64;
    }

    fn ack_positive(&self, stream_seq: u64, consumer_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.config.ack_policy == AckPolicy::All {
            let upto: Vec<u64> = inner
                .pending
                .range(..=stream_seq)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in upto {
                inner.pending.remove(&seq);
                inner.redelivery.cancel(seq);
            }
        } else {
            inner.pending.remove(&stream_seq);
            inner.redelivery.cancel(stream_seq);
        }
        let _ = consumer_seq;
        Self::advance_ack_floor(&mut inner);
        let floor = inner.ack_floor.stream_seq;
        drop(inner);
        if let Some(stream) = self.stream.upgrade() {
            stream.on_consumer_ack_floor_advanced(&self.name, floor);
        }
        Ok(())
    }

    fn nak(&self, stream_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.pending.contains_key(&stream_seq) {
            return Ok(());
        }
        inner.redelivery.cancel(stream_seq);
        inner.redeliver_queue.push_back(stream_seq);
        drop(inner);
        let _ = self.wake_tx.try_send(());
        Ok(())
    }

    fn wpi(&self, stream_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.pending.contains_key(&stream_seq) {
            return Ok(());
        }
        let ack_wait = Duration::from_millis(inner.config.ack_wait_ms().max(0) as u64);
        inner.redelivery.schedule(stream_seq, Instant::now() + ack_wait);
        Ok(())
    }

    fn term(&self, stream_seq: u64, consumer_seq: u64, reason: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.pending.remove(&stream_seq);
        inner.redelivery.cancel(stream_seq);
        inner.redeliver_queue.retain(|s| *s != stream_seq);
        Self::advance_ack_floor(&mut inner);
        let floor = inner.ack_floor.stream_seq;
        let deliveries = entry.map(|e| e.delivery_count).unwrap_or(0);
        drop(inner);
        log::info!(
            "consumer {}/{}: terminated stream_seq {} after {} deliveries",
            self.stream_name, self.name, stream_seq, deliveries
        );
        let advisory = TerminatedAdvisory {
            stream: self.stream_name.clone(),
            consumer: self.name.clone(),
            stream_seq,
            consumer_seq,
            deliveries,
            reason,
        };
        let subject = format!("{}.{}.{}", ADVISORY_TERMINATED_PREFIX, self.stream_name, self.name);
        if let Ok(body) = serde_json::to_vec(&advisory) {
            self.transport.publish(&subject, None, &crate::message::Headers::new(), &body);
        }
        if let Some(stream) = self.stream.upgrade() {
            stream.on_consumer_ack_floor_advanced(&self.name, floor);
        }
        Ok(())
    }

    /// Stops the background worker and drops all outstanding waiters.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.store(LifecycleState::Deleted as u8, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_worker(self: Arc<Consumer>) {
        loop {
            if self.deleted.load(Ordering::SeqCst) {
                return;
            }
            self.pump();

            let next_due = self.inner.lock().redelivery.next_due();
            let timeout = match next_due {
                Some(due) => due.saturating_duration_since(Instant::now()).min(DEFAULT_INACTIVE_THRESHOLD),
                None => DEFAULT_INACTIVE_THRESHOLD,
            };
            let _ = self.wake_rx.recv_timeout(timeout);
            self.check_ephemeral_inactivity();
        }
    }

    fn check_ephemeral_inactivity(&self) {
        if !self.ephemeral || self.deleted.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.lock();
        let Some(deliver_subject) = inner.config.deliver_subject.clone() else {
            return;
        };
        drop(inner);
        if self.transport.has_interest(&deliver_subject) {
            self.state.store(LifecycleState::Active as u8, Ordering::SeqCst);
            return;
        }
        if self.state.swap(LifecycleState::Inactive as u8, Ordering::SeqCst) == LifecycleState::Inactive as u8 {
            log::info!("consumer {}/{}: inactivity threshold reached, removing", self.stream_name, self.name);
            if let Some(stream) = self.stream.upgrade() {
                self.deleted.store(true, Ordering::SeqCst);
                stream.remove_consumer_internal(&self.name);
            }
        }
    }

    /// One pass of the delivery loop: fires any due redeliveries, then
    /// delivers as many eligible new/redelivered messages as are ready.
    fn pump(&self) {
        let Some(stream) = self.stream.upgrade() else { return };
        loop {
            {
                let mut inner = self.inner.lock();
                let due = inner.redelivery.pop_due(Instant::now());
                for seq in due {
                    if !inner.pending.contains_key(&seq) {
                        continue;
                    }
                    inner.redeliver_queue.push_back(seq);
                }
            }
            if !self.deliver_next(&stream) {
                break;
            }
        }
    }

    /// Attempts one delivery (redelivery first, else a new candidate).
    /// Returns true if progress was made and another pass should follow.
    fn deliver_next(&self, stream: &Arc<Stream>) -> bool {
        let candidate = {
            let mut inner = self.inner.lock();
            // Pull consumers only pick up a candidate once a waiter is
            // actually present to receive it; otherwise eligible
            // messages would silently consume a delivery attempt with
            // nowhere to send it.
            if inner.config.is_pull() && inner.waiters.is_empty() {
                None
            } else if let Some(seq) = inner.redeliver_queue.pop_front() {
                Some((seq, false))
            } else {
                self.find_new_candidate(&mut inner, stream)
            }
        };
        let Some((stream_seq, is_new)) = candidate else { return false };

        let msg = match stream.get_msg(stream_seq) {
            Ok(m) => m,
            Err(_) => {
                // Retention removed this sequence out from under us.
                let mut inner = self.inner.lock();
                inner.pending.remove(&stream_seq);
                inner.redelivery.cancel(stream_seq);
                Self::advance_ack_floor(&mut inner);
                return true;
            }
        };

        let (delivery_count, ack_wait, ack_policy, replay_policy, deliver_subject, rate_limit, is_pull) = {
            let inner = self.inner.lock();
            (
                inner.pending.get(&stream_seq).map(|p| p.delivery_count).unwrap_or(0),
                inner.config.ack_wait_ms(),
                inner.config.ack_policy,
                inner.config.replay_policy,
                inner.config.deliver_subject.clone(),
                inner.config.rate_limit,
                inner.config.is_pull(),
            )
        };

        let max_deliver = self.inner.lock().config.max_deliver();
        let next_count = delivery_count + 1;
        if max_deliver >= 0 && next_count as i64 > max_deliver {
            // Leave pending as-is; will never redeliver again until an
            // explicit ack/term, per spec.md §4.4 "Max-delivery
            // enforcement".
            return true;
        }

        if is_new && replay_policy == ReplayPolicy::Original {
            let mut inner = self.inner.lock();
            if let Some(last_ts) = inner.last_new_timestamp {
                let gap = msg.timestamp - last_ts;
                if let Ok(gap) = gap.to_std() {
                    drop(inner);
                    std::thread::sleep(gap.min(Duration::from_secs(60)));
                    inner = self.inner.lock();
                }
            }
            inner.last_new_timestamp = Some(msg.timestamp);
        }

        if rate_limit.is_some() {
            let size = msg.accounted_bytes() as usize;
            let mut bucket = self.rate_limiter.lock();
            if bucket.is_none() {
                *bucket = rate_limit.map(TokenBucket::new);
            }
            if let Some(b) = bucket.as_mut() {
                b.take(size);
            }
        }

        let consumer_seq = {
            let mut inner = self.inner.lock();
            let consumer_seq = inner.delivered.consumer_seq + 1;
            inner.delivered.consumer_seq = consumer_seq;
            if stream_seq > inner.delivered.stream_seq {
                inner.delivered.stream_seq = stream_seq;
            }
            consumer_seq
        };

        let pending_count = {
            let mut inner = self.inner.lock();
            let num_pending = (inner.pending.len() + inner.redeliver_queue.len()) as u64;
            if ack_policy != AckPolicy::None {
                inner.pending.insert(
                    stream_seq,
                    PendingEntry { delivered_at: Instant::now(), delivery_count: next_count },
                );
                inner.redelivery.schedule(stream_seq, Instant::now() + Duration::from_millis(ack_wait.max(0) as u64));
            } else {
                inner.ack_floor = inner.delivered;
            }
            num_pending
        };

        let token = build_ack_token(&self.stream_name, &self.name, next_count, stream_seq, consumer_seq, msg.timestamp, pending_count);
        let mut headers = msg.headers.clone();
        headers.insert(ORIGIN_SUBJECT_HEADER, msg.subject.as_str());

        if is_pull {
            // A waiter is normally guaranteed present here: deliver_next
            // only selects a pull candidate once `waiters` is non-empty.
            let waiter = self.inner.lock().waiters.pop_front();
            let Some(mut waiter) = waiter else {
                self.inner.lock().redeliver_queue.push_front(stream_seq);
                return false;
            };
            self.transport.publish(&waiter.reply_inbox, Some(&token), &headers, &msg.payload);
            waiter.batch_remaining = waiter.batch_remaining.saturating_sub(1);
            if waiter.batch_remaining > 0 {
                self.inner.lock().waiters.push_front(waiter);
            }
        } else if let Some(subject) = deliver_subject {
            self.transport.publish(&subject, Some(&token), &headers, &msg.payload);
        }

        true
    }

    fn find_new_candidate(&self, inner: &mut Inner, stream: &Arc<Stream>) -> Option<(u64, bool)> {
        loop {
            let scan_from = inner.next_scan_seq;
            let batch = stream.scan_from(scan_from).ok()?;
            let msg = batch.into_iter().next()?;
            inner.next_scan_seq = msg.seq + 1;
            let matches = match &inner.config.filter_subject {
                Some(filter) => subject::subject_matches_pattern(&msg.subject, filter),
                None => true,
            };
            if matches {
                return Some((msg.seq, true));
            }
        }
    }
}

struct ParsedAckToken<'a> {
    stream: &'a str,
    consumer: &'a str,
    stream_seq: u64,
    consumer_seq: u64,
}

fn build_ack_token(
    stream: &str,
    consumer: &str,
    delivery_count: u64,
    stream_seq: u64,
    consumer_seq: u64,
    timestamp: chrono::DateTime<Utc>,
    num_pending: u64,
) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}.{}.{}",
        ACK_PREFIX,
        stream,
        consumer,
        delivery_count,
        stream_seq,
        consumer_seq,
        timestamp.timestamp_millis(),
        num_pending,
    )
}

fn parse_ack_token(token: &str) -> Option<ParsedAckToken<'_>> {
    let rest = token.strip_prefix(ACK_PREFIX)?.strip_prefix('.')?;
    let mut parts = rest.splitn(7, '.');
    let stream = parts.next()?;
    let consumer = parts.next()?;
    let _delivery_count: u64 = parts.next()?.parse().ok()?;
    let stream_seq: u64 = parts.next()?.parse().ok()?;
    let consumer_seq: u64 = parts.next()?.parse().ok()?;
    Some(ParsedAckToken { stream, consumer, stream_seq, consumer_seq })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_token_round_trips() {
        let token = build_ack_token("MY_STREAM", "dur1", 2, 10, 5, Utc::now(), 3);
        let parsed = parse_ack_token(&token).unwrap();
        assert_eq!(parsed.stream, "MY_STREAM");
        assert_eq!(parsed.consumer, "dur1");
        assert_eq!(parsed.stream_seq, 10);
        assert_eq!(parsed.consumer_seq, 5);
    }

    #[test]
    fn ack_kind_parses_wire_bodies() {
        assert_eq!(AckKind::parse(b""), AckKind::Ack);
        assert_eq!(AckKind::parse(b"+ACK"), AckKind::Ack);
        assert_eq!(AckKind::parse(b"-NAK"), AckKind::Nak);
        assert_eq!(AckKind::parse(b"+WPI"), AckKind::Wpi);
        assert_eq!(AckKind::parse(b"+TERM"), AckKind::Term(None));
        assert_eq!(
            AckKind::parse(b"+TERM maxDeliveriesExceeded"),
            AckKind::Term(Some("maxDeliveriesExceeded".to_string()))
        );
        assert_eq!(AckKind::parse(b"+NXT 5"), AckKind::Next(Some(5)));
        assert_eq!(AckKind::parse(b"+NXT"), AckKind::Next(None));
    }
}
