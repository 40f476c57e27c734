//! Remote realtime store
//!
//! The remote store is a push-based JSON hierarchy. A client attaches a
//! listener to a path and receives the full value at that path immediately,
//! then again after every change underneath it. Writes are acknowledged
//! asynchronously, and a client can register "on disconnect" writes that the
//! server applies if the connection drops without an explicit write.
//!
//! Two implementations are provided:
//!
//! - [`MemoryRemoteStore`]: authoritative in-process tree, used offline and
//!   to simulate the server (drops, denials, failed writes) in tests
//! - [`WsRemoteStore`]: client for a realtime server over WebSocket

mod memory;
pub mod protocol;
mod ws;

pub use memory::MemoryRemoteStore;
pub use ws::{WsRemoteConfig, WsRemoteStore};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::paths::DataPath;

/// Errors reported by a remote store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Read or write refused by the server's rules
    #[error("Permission denied at '{path}'")]
    PermissionDenied { path: String },

    /// No connection to the server right now
    #[error("Remote store is offline")]
    Offline,

    /// The server refused a write
    #[error("Write to '{path}' rejected: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The store was shut down
    #[error("Remote store closed")]
    Closed,
}

/// Full value at a listened path
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: DataPath,
    /// `None` when nothing is stored at the path
    pub value: Option<Value>,
}

impl Snapshot {
    pub fn new(path: DataPath, value: Option<Value>) -> Self {
        let value = value.filter(|v| !v.is_null());
        Self { path, value }
    }

    pub fn empty(path: DataPath) -> Self {
        Self { path, value: None }
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Direct children as `(key, value)` pairs, in key order
    ///
    /// A missing or non-object value has no children.
    pub fn children(&self) -> Vec<(String, Value)> {
        match &self.value {
            Some(Value::Object(map)) => {
                let mut children: Vec<(String, Value)> = map
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                children.sort_by(|a, b| a.0.cmp(&b.0));
                children
            }
            _ => Vec::new(),
        }
    }
}

/// What a listener receives, in the order the store emits it
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Snapshot(Snapshot),
    Error(RemoteError),
}

/// Where a store delivers listener events
pub type SnapshotSink = mpsc::UnboundedSender<RemoteEvent>;

/// Identifies one attached listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub u64);

/// Connection state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Start delivering snapshots of `path` into `sink`
    ///
    /// The current value (possibly empty) is delivered first, then one
    /// snapshot per change. Errors (e.g. permission denied) are delivered as
    /// [`RemoteEvent::Error`].
    fn attach(&self, path: &DataPath, sink: SnapshotSink) -> ListenerHandle;

    /// Stop a listener; unknown handles are ignored
    fn detach(&self, handle: ListenerHandle);

    /// Write `value` at `path`; resolves once the server acknowledged it
    async fn set(&self, path: &DataPath, value: Value) -> Result<(), RemoteError>;

    /// Delete the node at `path`
    async fn remove(&self, path: &DataPath) -> Result<(), RemoteError> {
        self.set(path, Value::Null).await
    }

    /// Register a write the server applies if this connection drops
    ///
    /// Hooks live only as long as the current connection and must be
    /// registered again after every reconnect. Registering again for the
    /// same path replaces the earlier value.
    async fn run_on_disconnect(&self, path: &DataPath, value: Value) -> Result<(), RemoteError>;

    fn connection_status(&self) -> watch::Receiver<ConnectionStatus>;
}
