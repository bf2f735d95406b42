//! Account: the per-tenant root owning every Stream and Template, the
//! subject-routing table between them, and the shared
//! AccountResourceMgr/Transport/SnapshotPersistence collaborators
//! (spec.md §4.6, §4.7).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::account::{AccountLimits, AccountResourceMgr, AccountStats};
use crate::consumer::ConsumerConfig;
use crate::consumer::Consumer;
use crate::error::{err, Result};
use crate::message::Headers;
use crate::persist::SnapshotPersistence;
use crate::stream::{PubAck, Stream, StreamConfig, StreamInfo};
use crate::subject;
use crate::template::Template;
use crate::transport::Transport;

/// Owns every Stream and Template in one account, and routes publishes
/// to the right Stream (creating one from a matching Template on first
/// use, per spec.md §4.7).
pub struct Account {
    id: String,
    resources: Arc<AccountResourceMgr>,
    transport: Arc<dyn Transport>,
    data_root: Option<PathBuf>,
    persistence: Option<SnapshotPersistence>,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl Account {
    pub fn new(id: String, limits: AccountLimits, transport: Arc<dyn Transport>, data_root: Option<PathBuf>) -> Account {
        let persistence = data_root.as_ref().map(|root| SnapshotPersistence::new(root.clone()));
        Account {
            id,
            resources: Arc::new(AccountResourceMgr::new(limits)),
            transport,
            data_root,
            persistence,
            streams: RwLock::new(HashMap::new()),
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds every Stream (and its durable Consumers) persisted for
    /// this account, in place of a manual restart walk.
    pub fn rehydrate(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else { return Ok(()) };
        let streams = persistence.rehydrate(&self.id, self.resources.clone(), self.transport.clone())?;
        let mut map = self.streams.write();
        for stream in streams {
            map.insert(stream.name(), stream);
        }
        Ok(())
    }

    pub fn resources(&self) -> &Arc<AccountResourceMgr> {
        &self.resources
    }

    pub(crate) fn transport_for_restore(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn data_root_for_restore(&self) -> Option<PathBuf> {
        self.stream_data_root()
    }

    /// Registers a Stream reconstructed by [`crate::snapshot::SnapshotEngine::restore`]
    /// and persists its config/consumers, mirroring what [`Account::create_stream`]
    /// does for a freshly-created one.
    pub(crate) fn register_restored_stream(&self, stream: Arc<Stream>) {
        if let Some(p) = &self.persistence {
            let _ = p.save_stream_config(&self.id, &stream.config());
            for snap in stream.export_consumer_snapshots() {
                let _ = p.save_consumer(&self.id, &stream.name(), &snap);
            }
        }
        self.streams.write().insert(stream.name(), stream);
    }

    pub fn stats(&self) -> AccountStats {
        self.resources.stats()
    }

    fn stream_data_root(&self) -> Option<PathBuf> {
        self.data_root.as_ref().map(|root| root.join(&self.id))
    }

    fn subjects_free(&self, subjects: &[String], excluding: Option<&str>) -> Result<()> {
        let streams = self.streams.read();
        for (name, existing) in streams.iter() {
            if Some(name.as_str()) == excluding {
                continue;
            }
            let existing_subjects = existing.config().subjects;
            for s in subjects {
                for e in &existing_subjects {
                    if subject::patterns_overlap(s, e) {
                        return Err(err!(SubjectsOverlap, "subject '{}' overlaps stream '{}' subject '{}'", s, name, e));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn create_stream(&self, config: StreamConfig) -> Result<Arc<Stream>> {
        if self.streams.read().contains_key(&config.name) {
            return Err(err!(StreamAlreadyExists, "stream '{}' already exists", config.name));
        }
        self.subjects_free(&config.subjects, None)?;
        let stream = Stream::create(config.clone(), self.resources.clone(), self.transport.clone(), self.stream_data_root().as_deref())?;
        if let Some(p) = &self.persistence {
            p.save_stream_config(&self.id, &stream.config())?;
        }
        self.streams.write().insert(stream.name(), stream.clone());
        Ok(stream)
    }

    pub fn get_stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(name).cloned()
    }

    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stream_infos(&self) -> Vec<StreamInfo> {
        self.streams.read().values().map(|s| s.info()).collect()
    }

    pub fn update_stream(&self, name: &str, new_config: StreamConfig) -> Result<()> {
        let stream = self.get_stream(name).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
        self.subjects_free(&new_config.subjects, Some(name))?;
        stream.update(new_config)?;
        if let Some(p) = &self.persistence {
            p.save_stream_config(&self.id, &stream.config())?;
        }
        Ok(())
    }

    pub fn delete_stream(&self, name: &str) -> Result<()> {
        let stream = self
            .streams
            .write()
            .remove(name)
            .ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
        stream.delete();
        if let Some(owner) = &stream.config().template_owner {
            if let Some(template) = self.templates.read().get(owner) {
                template.forget(name);
            }
        }
        if let Some(p) = &self.persistence {
            p.delete_stream(&self.id, name)?;
        }
        Ok(())
    }

    pub fn purge_stream(&self, name: &str) -> Result<u64> {
        let stream = self.get_stream(name).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
        stream.purge()
    }

    pub fn add_consumer(&self, stream_name: &str, cfg: ConsumerConfig, client_has_interest: bool) -> Result<Arc<Consumer>> {
        let stream = self
            .get_stream(stream_name)
            .ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", stream_name))?;
        let consumer = stream.add_consumer(cfg, client_has_interest)?;
        if !consumer.is_ephemeral() {
            if let Some(p) = &self.persistence {
                p.save_consumer(&self.id, stream_name, &consumer.export_snapshot())?;
            }
        }
        Ok(consumer)
    }

    pub fn delete_consumer(&self, stream_name: &str, consumer_name: &str) -> Result<()> {
        let stream = self
            .get_stream(stream_name)
            .ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", stream_name))?;
        stream.delete_consumer(consumer_name)?;
        if let Some(p) = &self.persistence {
            p.delete_consumer(&self.id, stream_name, consumer_name)?;
        }
        Ok(())
    }

    /// Persists a durable Consumer's current delivery state, intended to
    /// be called periodically (e.g. after every ack) so a restart can
    /// rebuild `pending` per spec.md §4.4's "restart rebuilds pending
    /// from the last durable checkpoint".
    pub fn checkpoint_consumer(&self, stream_name: &str, consumer_name: &str) -> Result<()> {
        let Some(p) = &self.persistence else { return Ok(()) };
        let stream = self
            .get_stream(stream_name)
            .ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", stream_name))?;
        let consumer = stream
            .get_consumer(consumer_name)
            .ok_or_else(|| err!(ConsumerNotFound, "consumer '{}' not found", consumer_name))?;
        if consumer.is_ephemeral() {
            return Ok(());
        }
        p.save_consumer(&self.id, stream_name, &consumer.export_snapshot())
    }

    pub fn create_template(&self, name: String, subject_pattern: String, config_template: StreamConfig, max_streams: i64) -> Result<Arc<Template>> {
        if self.templates.read().contains_key(&name) {
            return Err(err!(StreamAlreadyExists, "template '{}' already exists", name));
        }
        let template = Arc::new(Template::new(name.clone(), subject_pattern, config_template, max_streams)?);
        self.templates.write().insert(name, template.clone());
        Ok(template)
    }

    pub fn get_template(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.read().get(name).cloned()
    }

    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Deletes a Template and every Stream it derived (spec.md §4.7).
    pub fn delete_template(&self, name: &str) -> Result<()> {
        let template = self
            .templates
            .write()
            .remove(name)
            .ok_or_else(|| err!(StreamNotFound, "template '{}' not found", name))?;
        for derived in template.derived_stream_names() {
            let _ = self.delete_stream(&derived);
        }
        Ok(())
    }

    /// Finds (or synthesizes, via a matching Template) the Stream bound
    /// to `subject` and ingests the publish into it.
    pub fn ingest(&self, subject: &str, headers: Headers, payload: Vec<u8>, reply_to: Option<&str>, msg_id: Option<&str>) -> Result<PubAck> {
        if let Some(stream) = self.find_stream_for_subject(subject) {
            return stream.ingest(subject, headers, payload, reply_to, msg_id);
        }
        let template = self
            .templates
            .read()
            .values()
            .find(|t| t.matches(subject))
            .cloned();
        match template {
            Some(template) => {
                let cfg = template.reserve_stream(subject)?;
                let stream = self.create_stream(cfg)?;
                stream.ingest(subject, headers, payload, reply_to, msg_id)
            }
            None => Err(err!(SubjectInvalid, "no stream or template bound to subject '{}'", subject)),
        }
    }

    fn find_stream_for_subject(&self, subject: &str) -> Option<Arc<Stream>> {
        self.streams
            .read()
            .values()
            .find(|s| crate::subject::matches_any(subject, &s.config().subjects))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StorageType;
    use crate::transport::RecordingTransport;

    fn mk_account() -> Account {
        Account::new(
            "acct1".to_string(),
            AccountLimits::unlimited(),
            Arc::new(RecordingTransport::new()),
            None,
        )
    }

    #[test]
    fn rejects_overlapping_subjects_across_streams() {
        let account = mk_account();
        account
            .create_stream(StreamConfig {
                name: "A".to_string(),
                subjects: vec!["foo.*".to_string()],
                storage: StorageType::Memory,
                ..Default::default()
            })
            .unwrap();
        let err = account
            .create_stream(StreamConfig {
                name: "B".to_string(),
                subjects: vec!["foo.bar".to_string()],
                storage: StorageType::Memory,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SubjectsOverlap);
    }

    #[test]
    fn synthesizes_a_stream_from_a_template_on_first_publish() {
        let account = mk_account();
        account
            .create_template(
                "orders-by-region".to_string(),
                "orders.*".to_string(),
                StreamConfig {
                    storage: StorageType::Memory,
                    ..Default::default()
                },
                -1,
            )
            .unwrap();
        let ack = account.ingest("orders.west", Headers::new(), b"hi".to_vec(), None, None).unwrap();
        assert_eq!(ack.stream, "west");
        assert!(account.get_stream("west").is_some());
    }

    #[test]
    fn ingest_without_a_bound_stream_or_template_fails() {
        let account = mk_account();
        let err = account.ingest("nowhere", Headers::new(), b"x".to_vec(), None, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SubjectInvalid);
    }
}
