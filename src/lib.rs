//! streamcore: a persistent, subject-addressed streaming core.
//!
//! A [`registry::Account`] owns a set of [`stream::Stream`]s and
//! [`template::Template`]s, routes publishes to the right one by subject,
//! and exposes a JSON management surface ([`mgmt`]) mirroring the
//! `mgmt.*` subject table. Each Stream is an append-only, deduplicated
//! [`message::Message`] log ([`store`]) with its own set of
//! [`consumer::Consumer`]s tracking independent delivery/ack state.
//! [`snapshot`] and [`persist`] cover, respectively, the wire protocol for
//! moving a Stream's state between processes and the on-disk layout that
//! survives a restart.

pub mod account;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod message;
pub mod mgmt;
pub mod persist;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod subject;
pub mod template;
pub mod transport;

pub use account::{AccountLimits, AccountResourceMgr, AccountStats};
pub use consumer::{Consumer, ConsumerConfig, ConsumerInfo, ConsumerSnapshot};
pub use error::{Error, ErrorKind, Result};
pub use message::{Headers, Message};
pub use registry::Account;
pub use stream::{PubAck, Stream, StreamConfig, StreamInfo};
pub use template::Template;
pub use transport::Transport;
