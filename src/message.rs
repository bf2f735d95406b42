//! The persisted unit of a Stream: an immutable, sequenced message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ordered multi-map from header name to its list of values, matching
/// NATS header semantics (repeated headers are preserved, not merged).
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers(pub Vec<(String, Vec<String>)>);

impl Headers {
    pub fn new() -> Headers {
        Headers(Vec::new())
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, value: S) {
        let name = name.into();
        let value = value.into();
        if let Some((_, values)) = self.0.iter_mut().find(|(n, _)| n == &name) {
            values.push(value);
        } else {
            self.0.push((name, vec![value]));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.first())
            .map(|s| s.as_str())
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Approximate on-wire size in bytes, used for `maxBytes` accounting.
    pub fn encoded_len(&self) -> usize {
        self.0
            .iter()
            .map(|(k, vs)| k.len() + vs.iter().map(|v| v.len() + 2).sum::<usize>())
            .sum()
    }
}

/// A single message assigned a sequence number by its owning MessageStore.
/// Immutable once returned from `append`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub subject: String,
    #[serde(default)]
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Total bytes counted against a Stream's `maxBytes`/`state.bytes`:
    /// payload plus headers, matching spec.md §8's quantified invariant.
    pub fn accounted_bytes(&self) -> u64 {
        (self.payload.len() + self.headers.encoded_len()) as u64
    }
}
