//! MessageStore: the persisted append log of messages, keyed by a
//! monotonically increasing sequence (spec.md §4.1).

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::message::{Headers, Message};
use chrono::{DateTime, Utc};

/// Aggregate counters tracked by a MessageStore, independent of any
/// retention policy applied above it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub num_deleted: u64,
}

/// The append-only, randomly-readable log underlying a single Stream.
/// Implementations must serialize `append` internally (spec.md §4.1: "is
/// strictly serialized within a Stream") and guarantee readers never
/// observe a partially appended message.
pub trait MessageStore: Send + Sync {
    /// Appends a new message, returning its assigned sequence
    /// (`last_seq + 1` at the instant of return). Does not return until
    /// the message is durable per the store's storage class.
    fn append(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Result<u64>;

    /// Reads a single message by sequence.
    fn get(&self, seq: u64) -> Result<Message>;

    /// Tombstones a message. Fails on already-deleted or never-existed
    /// sequences. Updates `first_seq` if the deleted sequence was head.
    fn delete_msg(&self, seq: u64) -> Result<bool>;

    /// Removes every message, resetting to an empty stream
    /// (`first_seq = last_seq + 1`, timestamps zeroed). Returns the
    /// number of messages removed.
    fn purge(&self) -> Result<u64>;

    fn first_seq(&self) -> u64;
    fn last_seq(&self) -> u64;
    fn state(&self) -> StoreState;

    /// All sequences at or above `seq` that are still present, in order.
    fn scan_from(&self, seq: u64) -> Result<Vec<Message>>;

    /// All sequences whose timestamp is at or after `t`, in order.
    fn scan_from_time(&self, t: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Evicts the oldest messages until none of `max_msgs`/`max_bytes`
    /// are exceeded (ignoring entries for which `retain` returns `false`,
    /// i.e. messages a retention policy isn't yet willing to give up).
    /// Returns the sequences removed.
    fn evict_to_limits(
        &self,
        max_msgs: i64,
        max_bytes: i64,
        max_age: i64,
        retain: &dyn Fn(u64) -> bool,
    ) -> Result<Vec<u64>>;

    /// Every live message in seq order, as the wire form the
    /// SnapshotEngine streams (spec.md §4.5). The default implementation
    /// composes from `scan_from`; backends may override for efficiency.
    fn snapshot_messages(&self) -> Result<Vec<Message>> {
        self.scan_from(self.first_seq())
    }

    /// Appends `messages` (already known not to collide with any
    /// existing sequence) as-is, used only by restore to replay a
    /// snapshot's message stream into a freshly created, empty store.
    fn restore_messages(&self, messages: Vec<Message>) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::message::Headers;
    use chrono::Utc;

    /// Runs the same behavioral assertions against any MessageStore
    /// implementation, so MemoryStore and FileStore can't silently drift
    /// apart.
    pub(crate) fn run(store: &dyn MessageStore) {
        assert_eq!(store.first_seq(), 1);
        assert_eq!(store.last_seq(), 0);

        let s1 = store
            .append("foo", Headers::new(), b"hello".to_vec(), Utc::now())
            .unwrap();
        let s2 = store
            .append("foo", Headers::new(), b"world".to_vec(), Utc::now())
            .unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(store.last_seq(), 2);

        let m = store.get(1).unwrap();
        assert_eq!(m.payload, b"hello");

        assert!(store.get(99).is_err());

        let state = store.state();
        assert_eq!(state.msgs, 2);
        assert_eq!(state.first_seq, 1);
        assert_eq!(state.last_seq, 2);

        assert!(store.delete_msg(1).unwrap());
        assert!(!store.delete_msg(1).is_ok() || store.get(1).is_err());
        assert_eq!(store.first_seq(), 2);

        let removed = store.purge().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.first_seq(), store.last_seq() + 1);
        assert_eq!(store.state().msgs, 0);
        assert_eq!(store.state().bytes, 0);

        let s3 = store
            .append("foo", Headers::new(), b"after-purge".to_vec(), Utc::now())
            .unwrap();
        assert_eq!(s3, store.first_seq());
    }
}
