//! Per-account resource accounting shared across every Stream in the
//! account (spec.md §4.6).

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{err, Result};
use crate::stream::config::StorageType;

/// `-1` means unlimited; `0` is a hard zero, matching spec.md's account
/// limit semantics.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct AccountLimits {
    pub max_memory: i64,
    pub max_store: i64,
    pub max_streams: i64,
    pub max_consumers: i64,
}

impl AccountLimits {
    pub fn unlimited() -> AccountLimits {
        AccountLimits {
            max_memory: -1,
            max_store: -1,
            max_streams: -1,
            max_consumers: -1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct AccountStats {
    pub memory_used: i64,
    pub store_used: i64,
    pub stream_count: i64,
    pub consumer_count: i64,
    pub limits: AccountLimits,
}

/// Tracks `{memoryUsed, storeUsed, streamCount, consumerCount}` against
/// `{maxMemory, maxStore, maxStreams, maxConsumers}`. All counters are
/// advisory at the point a Stream consults them before appending, and are
/// adjusted with atomic compare-swap so concurrent Streams in the same
/// account never overshoot a limit (spec.md §5 "Shared state").
pub struct AccountResourceMgr {
    limits: AccountLimits,
    memory_used: AtomicI64,
    store_used: AtomicI64,
    stream_count: AtomicUsize,
    consumer_count: AtomicUsize,
}

impl AccountResourceMgr {
    pub fn new(limits: AccountLimits) -> AccountResourceMgr {
        AccountResourceMgr {
            limits,
            memory_used: AtomicI64::new(0),
            store_used: AtomicI64::new(0),
            stream_count: AtomicUsize::new(0),
            consumer_count: AtomicUsize::new(0),
        }
    }

    pub fn limits(&self) -> AccountLimits {
        self.limits
    }

    pub fn stats(&self) -> AccountStats {
        AccountStats {
            memory_used: self.memory_used.load(Ordering::SeqCst),
            store_used: self.store_used.load(Ordering::SeqCst),
            stream_count: self.stream_count.load(Ordering::SeqCst) as i64,
            consumer_count: self.consumer_count.load(Ordering::SeqCst) as i64,
            limits: self.limits,
        }
    }

    fn bucket(&self, storage: StorageType) -> &AtomicI64 {
        match storage {
            StorageType::Memory => &self.memory_used,
            StorageType::File => &self.store_used,
        }
    }

    fn bucket_limit(&self, storage: StorageType) -> i64 {
        match storage {
            StorageType::Memory => self.limits.max_memory,
            StorageType::File => self.limits.max_store,
        }
    }

    /// Reserves `additional_bytes` against the bucket for `storage`,
    /// failing if it would exceed the account's limit for that bucket.
    pub fn reserve_bytes(&self, storage: StorageType, additional_bytes: i64) -> Result<()> {
        let limit = self.bucket_limit(storage);
        if limit < 0 {
            self.bucket(storage).fetch_add(additional_bytes, Ordering::SeqCst);
            return Ok(());
        }
        let bucket = self.bucket(storage);
        loop {
            let current = bucket.load(Ordering::SeqCst);
            let next = current + additional_bytes;
            if next > limit {
                return Err(err!(AccountResourceExhausted, "account resource limit exceeded"));
            }
            if bucket
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn release_bytes(&self, storage: StorageType, bytes: i64) {
        self.bucket(storage).fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn reserve_stream(&self) -> Result<()> {
        if self.limits.max_streams >= 0 {
            loop {
                let current = self.stream_count.load(Ordering::SeqCst);
                if current as i64 >= self.limits.max_streams {
                    return Err(err!(AccountResourceExhausted, "maximum streams exceeded"));
                }
                if self
                    .stream_count
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
            }
        } else {
            self.stream_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn release_stream(&self) {
        self.stream_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn reserve_consumer(&self) -> Result<()> {
        if self.limits.max_consumers >= 0 {
            loop {
                let current = self.consumer_count.load(Ordering::SeqCst);
                if current as i64 >= self.limits.max_consumers {
                    return Err(err!(MaxConsumersExceeded, "maximum consumers exceeded"));
                }
                if self
                    .consumer_count
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
            }
        } else {
            self.consumer_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn release_consumer(&self) {
        self.consumer_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_stream_cap() {
        let mgr = AccountResourceMgr::new(AccountLimits {
            max_streams: 1,
            ..AccountLimits::unlimited()
        });
        mgr.reserve_stream().unwrap();
        assert!(mgr.reserve_stream().is_err());
        mgr.release_stream();
        mgr.reserve_stream().unwrap();
    }

    #[test]
    fn enforces_byte_cap_per_bucket() {
        let mgr = AccountResourceMgr::new(AccountLimits {
            max_store: 100,
            ..AccountLimits::unlimited()
        });
        mgr.reserve_bytes(StorageType::File, 60).unwrap();
        mgr.reserve_bytes(StorageType::File, 60).unwrap_err();
        mgr.reserve_bytes(StorageType::Memory, 1_000_000).unwrap();
    }

    #[test]
    fn unlimited_when_negative() {
        let mgr = AccountResourceMgr::new(AccountLimits::unlimited());
        mgr.reserve_bytes(StorageType::File, i64::MAX / 2).unwrap();
    }
}
