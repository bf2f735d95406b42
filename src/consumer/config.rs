//! Consumer configuration and reported state, adapted from the JetStream
//! wire types (`ConsumerConfig`, `ConsumerInfo`, `SequencePair`) to the
//! semantics of spec.md §3–§4.4.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the Consumer selects the first message to deliver.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliverPolicy {
    #[serde(rename = "all")]
    All = 0,
    #[serde(rename = "last")]
    Last = 1,
    #[serde(rename = "new")]
    New = 2,
    #[serde(rename = "by_start_sequence")]
    ByStartSequence = 3,
    #[serde(rename = "by_start_time")]
    ByStartTime = 4,
}

impl Default for DeliverPolicy {
    fn default() -> DeliverPolicy {
        DeliverPolicy::All
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckPolicy {
    #[serde(rename = "none")]
    None = 0,
    #[serde(rename = "all")]
    All = 1,
    #[serde(rename = "explicit")]
    Explicit = 2,
}

impl Default for AckPolicy {
    fn default() -> AckPolicy {
        AckPolicy::Explicit
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplayPolicy {
    #[serde(rename = "instant")]
    Instant = 0,
    #[serde(rename = "original")]
    Original = 1,
}

impl Default for ReplayPolicy {
    fn default() -> ReplayPolicy {
        ReplayPolicy::Instant
    }
}

/// ConsumerConfig controls the behavior of a single Consumer attached to a
/// Stream. Only `deliver_subject` may be changed after creation, and only
/// while the Consumer is inactive (spec.md §3).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Empty for ephemeral Consumers.
    #[serde(default)]
    pub durable_name: Option<String>,
    pub deliver_subject: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    pub opt_start_seq: Option<u64>,
    pub opt_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// Milliseconds; default 30_000 when unset.
    pub ack_wait: Option<i64>,
    /// -1 for unlimited.
    pub max_deliver: Option<i64>,
    pub filter_subject: Option<String>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    /// Bits/sec; Push only.
    pub rate_limit: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> ConsumerConfig {
        ConsumerConfig {
            durable_name: None,
            deliver_subject: None,
            deliver_policy: DeliverPolicy::default(),
            opt_start_seq: None,
            opt_start_time: None,
            ack_policy: AckPolicy::default(),
            ack_wait: None,
            max_deliver: None,
            filter_subject: None,
            replay_policy: ReplayPolicy::default(),
            rate_limit: None,
        }
    }
}

impl From<&str> for ConsumerConfig {
    fn from(s: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: Some(s.to_string()),
            ..Default::default()
        }
    }
}

impl ConsumerConfig {
    pub fn ack_wait_ms(&self) -> i64 {
        self.ack_wait.unwrap_or(30_000)
    }

    pub fn max_deliver(&self) -> i64 {
        self.max_deliver.unwrap_or(-1)
    }

    pub fn is_pull(&self) -> bool {
        self.deliver_subject.is_none()
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub config: ConsumerConfig,
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    pub num_ack_pending: usize,
    pub num_redelivered: usize,
    pub num_waiting: usize,
    pub num_pending: u64,
}
