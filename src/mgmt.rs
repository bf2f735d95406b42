//! Management request/reply surface: `Account::handle_request` dispatches
//! a management subject + JSON body to the right Stream/Consumer/Template/
//! AccountResourceMgr operation and renders the `{"error": {...}} |
//! "result"` envelope (spec.md §6).

use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;
use crate::error::{err, Error, Result};
use crate::message::Message;
use crate::registry::Account;
use crate::snapshot::SnapshotEngine;
use crate::stream::{StreamConfig, StreamInfo};

const DEFAULT_PAGE_LIMIT: usize = 256;

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    result: T,
}

fn ok<T: Serialize>(value: T) -> Vec<u8> {
    serde_json::to_vec(&Envelope { result: value }).unwrap_or_else(|_| b"{}".to_vec())
}

fn fail(e: &Error) -> Vec<u8> {
    serde_json::to_vec(&e.as_envelope()).unwrap_or_else(|_| b"{}".to_vec())
}

#[derive(Debug, Default, Deserialize)]
struct PageRequest {
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Serialize)]
struct PagedResponse<T: Serialize> {
    total: usize,
    offset: usize,
    limit: usize,
    items: Vec<T>,
}

fn page<T: Serialize + Clone>(items: &[T], req: PageRequest) -> PagedResponse<T> {
    let total = items.len();
    let offset = req.offset.min(total);
    let end = (offset + DEFAULT_PAGE_LIMIT).min(total);
    PagedResponse {
        total,
        offset,
        limit: DEFAULT_PAGE_LIMIT,
        items: items[offset..end].to_vec(),
    }
}

#[derive(Debug, Serialize)]
struct PurgeResponse {
    purged: u64,
}

#[derive(Debug, Deserialize)]
struct StreamMsgGetRequest {
    seq: Option<u64>,
    last_by_subj: Option<String>,
    next_by_subj: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMsgDeleteRequest {
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    deliver_subject: String,
    chunk_size: Option<usize>,
    #[serde(default)]
    check_msgs: bool,
}

#[derive(Debug, Serialize)]
struct RestoreBegunResponse {
    deliver_subject: String,
}

#[derive(Debug, Deserialize)]
struct TemplateCreateRequest {
    subject_pattern: String,
    config_template: StreamConfig,
    max_streams: i64,
}

#[derive(Debug, Serialize)]
struct TemplateInfoResponse {
    name: String,
    subject_pattern: String,
    max_streams: i64,
    derived_streams: Vec<String>,
}

impl Account {
    /// Begins a restore for `target_name`, returning the inbox the caller
    /// should publish chunk bodies to (spec.md §4.5); the caller
    /// collects chunk bodies out of band and calls
    /// [`Account::complete_restore`] once the empty-payload terminator is
    /// seen.
    pub fn begin_restore(&self, target_name: &str) -> Result<String> {
        if self.get_stream(target_name).is_some() {
            return Err(err!(StreamAlreadyExists, "stream '{}' already exists", target_name));
        }
        Ok(format!("$RESTORE.{}.{}", target_name, nuid::next()))
    }

    /// Completes a restore begun with [`Account::begin_restore`]: `chunks`
    /// is every `(payload, reply_subject)` pair observed on the returned
    /// inbox, in publish order, including the final empty-payload
    /// terminator.
    pub fn complete_restore(&self, target_name: &str, chunks: &[(Vec<u8>, Option<String>)]) -> Result<StreamInfo> {
        let stream = SnapshotEngine::restore(
            target_name,
            chunks,
            self.resources().clone(),
            self.transport_for_restore(),
            self.data_root_for_restore(),
            |name| self.get_stream(name).is_some(),
        )?;
        let info = stream.info();
        self.register_restored_stream(stream);
        Ok(info)
    }

    /// Dispatches one management request; always returns a JSON envelope
    /// body, never an `Err` (rejections are rendered as the `error`
    /// envelope per spec.md §6).
    pub fn handle_request(&self, subject: &str, body: &[u8]) -> Vec<u8> {
        match self.dispatch(subject, body) {
            Ok(bytes) => bytes,
            Err(e) => fail(&e),
        }
    }

    fn dispatch(&self, subject: &str, body: &[u8]) -> Result<Vec<u8>> {
        let tokens: Vec<&str> = subject.split('.').collect();
        match tokens.as_slice() {
            ["mgmt", "INFO"] => Ok(ok(self.stats())),

            ["mgmt", "STREAM", "CREATE", name] => {
                let config: StreamConfig = parse_body(body)?;
                if config.name != *name {
                    return Err(err!(StreamConfigInvalid, "body config name '{}' does not match subject name '{}'", config.name, name));
                }
                let stream = self.create_stream(config)?;
                Ok(ok(stream.info()))
            }
            ["mgmt", "STREAM", "UPDATE", name] => {
                let config: StreamConfig = parse_body(body)?;
                self.update_stream(name, config)?;
                Ok(ok(self.get_stream(name).map(|s| s.info())))
            }
            ["mgmt", "STREAM", "DELETE", name] => {
                self.delete_stream(name)?;
                Ok(ok(true))
            }
            ["mgmt", "STREAM", "PURGE", name] => {
                let purged = self.purge_stream(name)?;
                Ok(ok(PurgeResponse { purged }))
            }
            ["mgmt", "STREAM", "INFO", name] => {
                let stream = self.get_stream(name).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
                Ok(ok(stream.info()))
            }
            ["mgmt", "STREAM", "NAMES"] | ["mgmt", "STREAM", "LIST"] => {
                let req: PageRequest = parse_body_or_default(body)?;
                Ok(ok(page(&self.stream_names(), req)))
            }
            ["mgmt", "STREAM", "MSG", "GET", name] => {
                let stream = self.get_stream(name).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
                let req: StreamMsgGetRequest = parse_body(body)?;
                let msg = resolve_msg_get(&stream, &req)?;
                Ok(ok(msg))
            }
            ["mgmt", "STREAM", "MSG", "DELETE", name] => {
                let stream = self.get_stream(name).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
                let req: StreamMsgDeleteRequest = parse_body(body)?;
                stream.delete_msg(req.seq)?;
                Ok(ok(true))
            }
            ["mgmt", "STREAM", "SNAPSHOT", name] => {
                let stream = self.get_stream(name).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", name))?;
                let req: SnapshotRequest = parse_body(body)?;
                let transport = self.transport_for_restore();
                // Flow control (waiting for each chunk's reply before
                // publishing the next) is the transport collaborator's
                // job; this dispatch publishes the full sequence eagerly.
                SnapshotEngine::send(&stream, &*transport, &req.deliver_subject, req.chunk_size, || true)?;
                let _ = req.check_msgs;
                Ok(ok(true))
            }
            ["mgmt", "STREAM", "RESTORE", name] => {
                let deliver_subject = self.begin_restore(name)?;
                Ok(ok(RestoreBegunResponse { deliver_subject }))
            }

            ["mgmt", "CONSUMER", "CREATE", stream] => {
                let config: ConsumerConfig = parse_body(body)?;
                let consumer = self.add_consumer(stream, config, true)?;
                Ok(ok(consumer.info()))
            }
            ["mgmt", "CONSUMER", "DURABLE", "CREATE", stream, durable] => {
                let mut config: ConsumerConfig = parse_body(body)?;
                config.durable_name = Some(durable.to_string());
                let consumer = self.add_consumer(stream, config, true)?;
                Ok(ok(consumer.info()))
            }
            ["mgmt", "CONSUMER", "INFO", stream, consumer] => {
                let stream = self.get_stream(stream).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", stream))?;
                let consumer = stream.get_consumer(consumer).ok_or_else(|| err!(ConsumerNotFound, "consumer '{}' not found", consumer))?;
                Ok(ok(consumer.info()))
            }
            ["mgmt", "CONSUMER", "DELETE", stream, consumer] => {
                self.delete_consumer(stream, consumer)?;
                Ok(ok(true))
            }
            ["mgmt", "CONSUMER", "NAMES", stream] => {
                let stream = self.get_stream(stream).ok_or_else(|| err!(StreamNotFound, "stream '{}' not found", stream))?;
                let req: PageRequest = parse_body_or_default(body)?;
                let mut names = stream.consumer_names();
                names.sort();
                Ok(ok(page(&names, req)))
            }

            ["mgmt", "TEMPLATE", "CREATE", name] => {
                let req: TemplateCreateRequest = parse_body(body)?;
                let template = self.create_template(name.to_string(), req.subject_pattern, req.config_template, req.max_streams)?;
                Ok(ok(template_info(&template)))
            }
            ["mgmt", "TEMPLATE", "DELETE", name] => {
                self.delete_template(name)?;
                Ok(ok(true))
            }
            ["mgmt", "TEMPLATE", "INFO", name] => {
                let template = self.get_template(name).ok_or_else(|| err!(StreamNotFound, "template '{}' not found", name))?;
                Ok(ok(template_info(&template)))
            }
            ["mgmt", "TEMPLATE", "NAMES"] => {
                let req: PageRequest = parse_body_or_default(body)?;
                Ok(ok(page(&self.template_names(), req)))
            }

            _ => Err(err!(NotFound, "no management handler for subject '{}'", subject)),
        }
    }
}

fn template_info(t: &std::sync::Arc<crate::template::Template>) -> TemplateInfoResponse {
    TemplateInfoResponse {
        name: t.name().to_string(),
        subject_pattern: t.subject_pattern().to_string(),
        max_streams: t.max_streams(),
        derived_streams: t.derived_stream_names(),
    }
}

fn resolve_msg_get(stream: &std::sync::Arc<crate::stream::Stream>, req: &StreamMsgGetRequest) -> Result<Message> {
    if let Some(seq) = req.seq {
        return stream.get_msg(seq);
    }
    if let Some(subj) = &req.last_by_subj {
        let msgs = stream.scan_from(stream.state().first_seq)?;
        return msgs
            .into_iter()
            .filter(|m| crate::subject::subject_matches_pattern(&m.subject, subj))
            .last()
            .ok_or_else(|| err!(NotFound, "no message found for subject '{}'", subj));
    }
    if let Some(subj) = &req.next_by_subj {
        let msgs = stream.scan_from(stream.state().first_seq)?;
        return msgs
            .into_iter()
            .find(|m| crate::subject::subject_matches_pattern(&m.subject, subj))
            .ok_or_else(|| err!(NotFound, "no message found for subject '{}'", subj));
    }
    Err(err!(StreamConfigInvalid, "message get request requires seq, last_by_subj, or next_by_subj"))
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| err!(StreamConfigInvalid, "invalid request body: {}", e))
}

fn parse_body_or_default<T: for<'de> Deserialize<'de> + Default>(body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    parse_body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountLimits;
    use crate::stream::StorageType;
    use crate::transport::RecordingTransport;
    use std::sync::Arc;

    fn mk_account() -> Account {
        Account::new("acct1".to_string(), AccountLimits::unlimited(), Arc::new(RecordingTransport::new()), None)
    }

    #[test]
    fn create_info_and_delete_stream_round_trip() {
        let account = mk_account();
        let body = serde_json::to_vec(&StreamConfig {
            name: "ORDERS".to_string(),
            subjects: vec!["orders".to_string()],
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
        let reply = account.handle_request("mgmt.STREAM.CREATE.ORDERS", &body);
        let v: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert!(v.get("result").is_some(), "{:?}", v);

        let reply = account.handle_request("mgmt.STREAM.INFO.ORDERS", b"");
        let v: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(v["result"]["config"]["name"], "ORDERS");

        let reply = account.handle_request("mgmt.STREAM.DELETE.ORDERS", b"");
        let v: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(v["result"], true);
    }

    #[test]
    fn unknown_subject_is_an_error_envelope() {
        let account = mk_account();
        let reply = account.handle_request("mgmt.NOPE", b"");
        let v: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert!(v.get("error").is_some());
    }

    #[test]
    fn create_rejects_name_mismatch() {
        let account = mk_account();
        let body = serde_json::to_vec(&StreamConfig {
            name: "OTHER".to_string(),
            storage: StorageType::Memory,
            ..Default::default()
        })
        .unwrap();
        let reply = account.handle_request("mgmt.STREAM.CREATE.ORDERS", &body);
        let v: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert!(v.get("error").is_some());
    }
}
