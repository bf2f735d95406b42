//! Bounded time-window index mapping publisher-supplied message ids to
//! recently assigned sequences (spec.md §4.2).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

struct Entry {
    seq: u64,
    ts: DateTime<Utc>,
}

/// `DedupIndex` caps itself purely by time (`Stream.dedupWindow`), not by
/// entry count. Lookup is O(1); `evict_older_than` is called periodically
/// by the owning Stream, and opportunistically on each `record`.
pub struct DedupIndex {
    entries: Mutex<HashMap<String, Entry>>,
}

impl DedupIndex {
    pub fn new() -> DedupIndex {
        DedupIndex {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the previously recorded sequence if `msg_id` is still
    /// within the dedup window.
    pub fn check(&self, msg_id: &str) -> Option<u64> {
        self.entries.lock().get(msg_id).map(|e| e.seq)
    }

    pub fn record(&self, msg_id: String, seq: u64, ts: DateTime<Utc>) {
        self.entries.lock().insert(msg_id, Entry { seq, ts });
    }

    /// Drops every entry recorded before `cutoff`.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) {
        self.entries.lock().retain(|_, e| e.ts >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupIndex {
    fn default() -> DedupIndex {
        DedupIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn records_and_checks() {
        let idx = DedupIndex::new();
        assert!(idx.check("a").is_none());
        idx.record("a".to_string(), 1, Utc::now());
        assert_eq!(idx.check("a"), Some(1));
    }

    #[test]
    fn evicts_by_time_only() {
        let idx = DedupIndex::new();
        let old = Utc::now() - Duration::seconds(10);
        idx.record("old".to_string(), 1, old);
        idx.record("new".to_string(), 2, Utc::now());
        idx.evict_older_than(Utc::now() - Duration::seconds(5));
        assert!(idx.check("old").is_none());
        assert_eq!(idx.check("new"), Some(2));
        assert_eq!(idx.len(), 1);
    }
}
