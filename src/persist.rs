//! SnapshotPersistence: on-disk layout for Stream/Consumer config and
//! state across restarts.
//!
//! Layout under `root`:
//!   <root>/<account>/<stream>/config.json        (StreamConfig)
//!   <root>/<account>/<stream>/blk_*.log          (FileStore's own blocks)
//!   <root>/<account>/<stream>/consumers/<name>/config.json
//!   <root>/<account>/<stream>/consumers/<name>/state.json
//!
//! Ephemeral Consumers have no `consumers/<name>` directory and so don't
//! survive a restart (spec.md §6).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::account::AccountResourceMgr;
use crate::consumer::ConsumerSnapshot;
use crate::error::Result;
use crate::stream::{Stream, StreamConfig};
use crate::transport::Transport;

fn stream_dir(root: &Path, account: &str, stream: &str) -> PathBuf {
    root.join(account).join(stream)
}

/// Writes `value` as pretty JSON to `path`, via a temp file in the same
/// directory fsync'd and renamed over the destination, so a crash mid-write
/// never leaves a half-written config/state file behind.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .expect("persisted paths are always constructed with a parent directory");
    fs::create_dir_all(parent)?;
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp");
    let tmp = parent.join(format!(".{}.tmp", file_name));
    let body = serde_json::to_vec_pretty(value)?;
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&body)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Crash-safe persistence of Stream/Consumer config and Consumer
/// delivery state, and the `rehydrate` path that rebuilds an account's
/// Streams from it at startup.
pub struct SnapshotPersistence {
    root: PathBuf,
}

impl SnapshotPersistence {
    pub fn new(root: impl Into<PathBuf>) -> SnapshotPersistence {
        SnapshotPersistence { root: root.into() }
    }

    fn account_dir(&self, account: &str) -> PathBuf {
        self.root.join(account)
    }

    /// Writes (or overwrites) a Stream's config.
    pub fn save_stream_config(&self, account: &str, config: &StreamConfig) -> Result<()> {
        let path = stream_dir(&self.root, account, &config.name).join("config.json");
        atomic_write_json(&path, config)
    }

    /// Writes a durable Consumer's config and its current delivery state.
    pub fn save_consumer(&self, account: &str, stream: &str, snap: &ConsumerSnapshot) -> Result<()> {
        let dir = stream_dir(&self.root, account, stream).join("consumers").join(&snap.name);
        atomic_write_json(&dir.join("config.json"), &snap.config)?;
        atomic_write_json(&dir.join("state.json"), snap)
    }

    pub fn delete_consumer(&self, account: &str, stream: &str, name: &str) -> Result<()> {
        let dir = stream_dir(&self.root, account, stream).join("consumers").join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn delete_stream(&self, account: &str, stream: &str) -> Result<()> {
        let dir = stream_dir(&self.root, account, stream);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Walks `<root>/<account>/` and rebuilds every Stream found there
    /// along with its durable Consumers' delivery state. Returns the
    /// reconstructed Streams in directory-listing (name-sorted) order.
    pub fn rehydrate(
        &self,
        account_id: &str,
        account: Arc<AccountResourceMgr>,
        transport: Arc<dyn Transport>,
    ) -> Result<Vec<Arc<Stream>>> {
        let account_dir = self.account_dir(account_id);
        if !account_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut stream_dirs: Vec<PathBuf> = fs::read_dir(&account_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        stream_dirs.sort();

        let mut streams = Vec::new();
        for dir in stream_dirs {
            let config_path = dir.join("config.json");
            if !config_path.is_file() {
                continue;
            }
            let config: StreamConfig = serde_json::from_slice(&fs::read(&config_path)?)?;
            let stream = Stream::create(config, account.clone(), transport.clone(), Some(&account_dir))?;

            let consumers_dir = dir.join("consumers");
            if consumers_dir.is_dir() {
                let mut consumer_dirs: Vec<PathBuf> = fs::read_dir(&consumers_dir)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect();
                consumer_dirs.sort();
                for cdir in consumer_dirs {
                    let state_path = cdir.join("state.json");
                    if !state_path.is_file() {
                        continue;
                    }
                    let snap: ConsumerSnapshot = serde_json::from_slice(&fs::read(&state_path)?)?;
                    stream.restore_consumer_from_snapshot(snap)?;
                }
            }
            streams.push(stream);
        }
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountLimits;
    use crate::consumer::ConsumerConfig;
    use crate::message::Headers;
    use crate::stream::StorageType;
    use crate::transport::RecordingTransport;
    use tempfile::tempdir;

    #[test]
    fn rehydrates_stream_config_messages_and_durable_consumer() {
        let dir = tempdir().unwrap();
        let persistence = SnapshotPersistence::new(dir.path());
        let transport = Arc::new(RecordingTransport::new());
        let account = Arc::new(AccountResourceMgr::new(AccountLimits::unlimited()));

        let config = StreamConfig {
            name: "ORDERS".to_string(),
            subjects: vec!["orders".to_string()],
            storage: StorageType::File,
            ..Default::default()
        };
        persistence.save_stream_config("acct1", &config).unwrap();

        let stream = Stream::create(config, account.clone(), transport.clone(), Some(&dir.path().join("acct1"))).unwrap();
        for i in 0..5 {
            stream.ingest("orders", Headers::new(), vec![i], None, None).unwrap();
        }
        let consumer = stream.add_consumer(ConsumerConfig::from("durable-a"), true).unwrap();
        consumer.notify_new_seq();
        std::thread::sleep(std::time::Duration::from_millis(50));
        persistence.save_consumer("acct1", "ORDERS", &consumer.export_snapshot()).unwrap();

        let account2 = Arc::new(AccountResourceMgr::new(AccountLimits::unlimited()));
        let rehydrated = persistence.rehydrate("acct1", account2, transport).unwrap();
        assert_eq!(rehydrated.len(), 1);
        assert_eq!(rehydrated[0].name(), "ORDERS");
        assert_eq!(rehydrated[0].state().msgs, 5);
        let rehydrated_consumer = rehydrated[0].get_consumer("durable-a").unwrap();
        assert_eq!(rehydrated_consumer.ack_floor_stream_seq(), consumer.ack_floor_stream_seq());
    }
}
