//! The pub/sub transport is an external collaborator (spec.md §1): the
//! core only needs "publish on subject S with payload P and optional
//! reply R" and a way to ask whether a subject currently has live
//! subscriber interest. Everything else (subject matching, client
//! connections, wire framing, clustering, TLS) lives outside this crate.

use std::sync::Mutex;

use crate::message::Headers;

/// What the core needs from the surrounding pub/sub transport.
pub trait Transport: Send + Sync {
    /// Publishes `payload` on `subject`, optionally with a reply-to
    /// subject attached (used for pub acks and delivery reply tokens).
    fn publish(&self, subject: &str, reply: Option<&str>, headers: &Headers, payload: &[u8]);

    /// Does the transport currently report live subscriber interest on
    /// `subject`? Used for ephemeral push-consumer creation (spec.md
    /// §4.3) and as the liveness signal for the ephemeral-consumer
    /// inactivity timer (spec.md §4.4).
    fn has_interest(&self, subject: &str) -> bool;
}

/// A single recorded outbound publish, captured by [`RecordingTransport`]
/// for tests that need to assert on what the core sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// An in-memory [`Transport`] used by tests: records every publish and
/// reports interest for any subject in an explicit allow-set (defaulting
/// to "interest in everything" unless [`RecordingTransport::no_interest`]
/// has been called for it).
pub struct RecordingTransport {
    published: Mutex<Vec<RecordedPublish>>,
    no_interest: Mutex<std::collections::HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> RecordingTransport {
        RecordingTransport {
            published: Mutex::new(Vec::new()),
            no_interest: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn deny_interest(&self, subject: &str) {
        self.no_interest.lock().unwrap().insert(subject.to_string());
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().unwrap().clone()
    }

    pub fn drain(&self) -> Vec<RecordedPublish> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }
}

impl Default for RecordingTransport {
    fn default() -> RecordingTransport {
        RecordingTransport::new()
    }
}

impl Transport for RecordingTransport {
    fn publish(&self, subject: &str, reply: Option<&str>, headers: &Headers, payload: &[u8]) {
        self.published.lock().unwrap().push(RecordedPublish {
            subject: subject.to_string(),
            reply: reply.map(|s| s.to_string()),
            headers: headers.clone(),
            payload: payload.to_vec(),
        });
    }

    fn has_interest(&self, subject: &str) -> bool {
        !self.no_interest.lock().unwrap().contains(subject)
    }
}
