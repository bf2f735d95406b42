//! Stream configuration and reported state, adapted from the JetStream
//! wire types (`StreamConfig`, `StreamInfo`, `StreamState`) to the
//! semantics of spec.md §3.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How messages are retained once the underlying limits would otherwise
/// let them stay.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RetentionPolicy {
    /// Messages are retained until a size/age/count limit is hit.
    #[serde(rename = "limits")]
    Limits = 0,
    /// A message is removed once every Consumer has acked past it.
    #[serde(rename = "interest")]
    Interest = 1,
    /// A message is removed once its single eligible Consumer acks it.
    #[serde(rename = "workqueue")]
    WorkQueue = 2,
}

impl Default for RetentionPolicy {
    fn default() -> RetentionPolicy {
        RetentionPolicy::Limits
    }
}

/// What happens when a limit is hit on ingest.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscardPolicy {
    /// Evict the oldest messages to make room (the default).
    #[serde(rename = "old")]
    Old = 0,
    /// Reject the new message instead.
    #[serde(rename = "new")]
    New = 1,
}

impl Default for DiscardPolicy {
    fn default() -> DiscardPolicy {
        DiscardPolicy::Old
    }
}

/// Where message bytes live.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageType {
    #[serde(rename = "file")]
    File = 0,
    #[serde(rename = "memory")]
    Memory = 1,
}

impl Default for StorageType {
    fn default() -> StorageType {
        StorageType::File
    }
}

/// StreamConfig determines the properties of a Stream. Mutable fields per
/// spec.md §4.3 `update`: `subjects`, `max_msgs`, `max_bytes`, `max_age`,
/// `max_msg_size`, `no_ack`, `duplicate_window`. Everything else is fixed
/// at creation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// -1 disables the per-stream consumer cap.
    #[serde(default = "default_unlimited")]
    pub max_consumers: i64,
    #[serde(default = "default_unlimited")]
    pub max_msgs: i64,
    #[serde(default = "default_unlimited")]
    pub max_bytes: i64,
    #[serde(default)]
    pub discard: DiscardPolicy,
    /// Max age in milliseconds; -1 disables.
    #[serde(default = "default_unlimited")]
    pub max_age: i64,
    /// -1 disables the per-message size cap.
    #[serde(default = "default_unlimited")]
    pub max_msg_size: i64,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default = "default_replicas")]
    pub num_replicas: usize,
    #[serde(default)]
    pub no_ack: bool,
    /// Owning Template name, if this Stream was synthesized by one.
    pub template_owner: Option<String>,
    /// Dedup window in milliseconds; 0 means "use the crate default".
    #[serde(default)]
    pub duplicate_window: i64,
}

fn default_unlimited() -> i64 {
    -1
}

fn default_replicas() -> usize {
    1
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            name: String::new(),
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            max_consumers: -1,
            max_msgs: -1,
            max_bytes: -1,
            discard: DiscardPolicy::default(),
            max_age: -1,
            max_msg_size: -1,
            storage: StorageType::default(),
            num_replicas: 1,
            no_ack: false,
            template_owner: None,
            duplicate_window: 0,
        }
    }
}

impl From<&str> for StreamConfig {
    fn from(s: &str) -> StreamConfig {
        StreamConfig {
            name: s.to_string(),
            ..Default::default()
        }
    }
}

/// Current measured state of a Stream, derived rather than persisted.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    /// Timestamp of the first live message, zero on an empty stream.
    pub first_time: DateTime<Utc>,
    /// Timestamp of the last live message, zero on an empty stream.
    pub last_time: DateTime<Utc>,
    pub consumer_count: usize,
    /// Tombstoned-but-not-yet-compacted messages within
    /// `[first_seq, last_seq]`.
    pub num_deleted: u64,
}

/// The zero value spec.md §3 calls for on an empty stream: Unix epoch.
pub fn zero_time() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(0).single().expect("epoch is representable")
}

impl Default for StreamState {
    fn default() -> StreamState {
        StreamState {
            msgs: 0,
            bytes: 0,
            first_seq: 0,
            last_seq: 0,
            first_time: zero_time(),
            last_time: zero_time(),
            consumer_count: 0,
            num_deleted: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
    pub state: StreamState,
}

/// The acknowledgement returned on a successful (or duplicate) ingest,
/// mirrored in the `+OK <json>` / `-ERR` publish-response protocol (§6).
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}
