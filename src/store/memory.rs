//! In-RAM MessageStore backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{MessageStore, StoreState};
use crate::error::{err, Result};
use crate::message::{Headers, Message};

struct Inner {
    messages: BTreeMap<u64, Message>,
    first_seq: u64,
    last_seq: u64,
    bytes: u64,
    num_deleted: u64,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            messages: BTreeMap::new(),
            first_seq: 1,
            last_seq: 0,
            bytes: 0,
            num_deleted: 0,
        }
    }
}

/// `MemoryStore` keeps every message in a `BTreeMap<seq, Message>` guarded
/// by a single `RwLock`, matching §4.1's requirement that `append` is
/// strictly serialized while reads may proceed concurrently.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            inner: RwLock::new(Inner::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl MessageStore for MemoryStore {
    fn append(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        let seq = inner.last_seq + 1;
        let msg = Message {
            seq,
            subject: subject.to_string(),
            headers,
            payload,
            timestamp,
        };
        inner.bytes += msg.accounted_bytes();
        inner.messages.insert(seq, msg);
        inner.last_seq = seq;
        Ok(seq)
    }

    fn get(&self, seq: u64) -> Result<Message> {
        let inner = self.inner.read();
        inner
            .messages
            .get(&seq)
            .cloned()
            .ok_or_else(|| err!(NotFound, "message {} not found", seq))
    }

    fn delete_msg(&self, seq: u64) -> Result<bool> {
        let mut inner = self.inner.write();
        let removed = inner
            .messages
            .remove(&seq)
            .ok_or_else(|| err!(NotFound, "message {} not found", seq))?;
        inner.bytes = inner.bytes.saturating_sub(removed.accounted_bytes());
        inner.num_deleted += 1;
        if seq == inner.first_seq {
            inner.first_seq = inner
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(inner.last_seq + 1);
        }
        Ok(true)
    }

    fn purge(&self) -> Result<u64> {
        let mut inner = self.inner.write();
        let removed = inner.messages.len() as u64;
        inner.messages.clear();
        inner.bytes = 0;
        inner.num_deleted = 0;
        inner.first_seq = inner.last_seq + 1;
        Ok(removed)
    }

    fn first_seq(&self) -> u64 {
        self.inner.read().first_seq
    }

    fn last_seq(&self) -> u64 {
        self.inner.read().last_seq
    }

    fn state(&self) -> StoreState {
        let inner = self.inner.read();
        StoreState {
            msgs: inner.messages.len() as u64,
            bytes: inner.bytes,
            first_seq: inner.first_seq,
            last_seq: inner.last_seq,
            num_deleted: inner.num_deleted,
        }
    }

    fn scan_from(&self, seq: u64) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        Ok(inner.messages.range(seq..).map(|(_, m)| m.clone()).collect())
    }

    fn scan_from_time(&self, t: DateTime<Utc>) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        Ok(inner
            .messages
            .values()
            .filter(|m| m.timestamp >= t)
            .cloned()
            .collect())
    }

    fn evict_to_limits(
        &self,
        max_msgs: i64,
        max_bytes: i64,
        max_age: i64,
        retain: &dyn Fn(u64) -> bool,
    ) -> Result<Vec<u64>> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        loop {
            let msgs = inner.messages.len() as i64;
            let bytes = inner.bytes as i64;
            let over_msgs = max_msgs >= 0 && msgs > max_msgs;
            let over_bytes = max_bytes >= 0 && bytes > max_bytes;
            let over_age = if max_age >= 0 {
                let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age);
                inner
                    .messages
                    .values()
                    .next()
                    .map(|m| m.timestamp < cutoff)
                    .unwrap_or(false)
            } else {
                false
            };
            if !(over_msgs || over_bytes || over_age) {
                break;
            }
            let oldest = match inner.messages.keys().next().copied() {
                Some(s) => s,
                None => break,
            };
            if !retain(oldest) {
                // A dependent retention policy (e.g. Interest) isn't done
                // with this message yet; don't evict further.
                break;
            }
            if let Some(m) = inner.messages.remove(&oldest) {
                inner.bytes = inner.bytes.saturating_sub(m.accounted_bytes());
                inner.num_deleted += 1;
                removed.push(oldest);
            }
            inner.first_seq = inner
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(inner.last_seq + 1);
        }
        Ok(removed)
    }

    fn restore_messages(&self, messages: Vec<Message>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut first_inserted = inner.messages.is_empty();
        for msg in messages {
            inner.first_seq = if first_inserted { msg.seq } else { inner.first_seq.min(msg.seq) };
            first_inserted = false;
            inner.last_seq = inner.last_seq.max(msg.seq);
            inner.bytes += msg.accounted_bytes();
            inner.messages.insert(msg.seq, msg);
        }
        if inner.messages.is_empty() {
            inner.first_seq = inner.last_seq + 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn conforms() {
        let store = MemoryStore::new();
        conformance::run(&store);
    }

    #[test]
    fn evicts_oldest_first_under_max_msgs() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append("foo", Headers::new(), vec![i as u8], Utc::now())
                .unwrap();
        }
        let removed = store.evict_to_limits(3, -1, -1, &|_| true).unwrap();
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(store.state().msgs, 3);
        assert_eq!(store.first_seq(), 3);
    }

    #[test]
    fn interest_eviction_waits_on_retain_predicate() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .append("foo", Headers::new(), vec![i as u8], Utc::now())
                .unwrap();
        }
        let removed = store.evict_to_limits(1, -1, -1, &|_| false).unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.state().msgs, 3);
    }
}
