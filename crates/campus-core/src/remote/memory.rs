//! In-process remote store
//!
//! Holds the authoritative JSON tree for one simulated server and a single
//! client connection to it. Besides serving the [`RemoteStore`] contract it
//! exposes the server side: writes from "other clients", permission rules,
//! write failures, and dropping/restoring the connection (which fires the
//! registered disconnect hooks).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use super::{
    ConnectionStatus, ListenerHandle, RemoteError, RemoteEvent, RemoteStore, Snapshot, SnapshotSink,
};
use crate::paths::DataPath;

struct Listener {
    path: DataPath,
    sink: SnapshotSink,
}

struct MemoryState {
    root: Value,
    listeners: HashMap<u64, Listener>,
    next_listener: u64,
    disconnect_hooks: Vec<(DataPath, Value)>,
    denied: Vec<DataPath>,
    fail_writes: bool,
    connected: bool,
}

impl MemoryState {
    fn is_denied(&self, path: &DataPath) -> bool {
        self.denied.iter().any(|rule| rule.overlaps(path))
    }

    fn snapshot(&self, path: &DataPath) -> Snapshot {
        Snapshot::new(path.clone(), value_at(&self.root, path))
    }

    fn deliver(&self, listener: &Listener) {
        let event = if self.is_denied(&listener.path) {
            RemoteEvent::Error(RemoteError::PermissionDenied {
                path: listener.path.to_string(),
            })
        } else {
            RemoteEvent::Snapshot(self.snapshot(&listener.path))
        };
        // A closed sink means the consumer is gone; detach cleans up later.
        let _ = listener.sink.send(event);
    }

    fn notify(&self, changed: &DataPath) {
        if !self.connected {
            return;
        }
        let mut ids: Vec<&u64> = self.listeners.keys().collect();
        ids.sort();
        for id in ids {
            let listener = &self.listeners[id];
            if listener.path.overlaps(changed) && !self.is_denied(&listener.path) {
                self.deliver(listener);
            }
        }
    }

    fn write(&mut self, path: &DataPath, value: Value) {
        write_at(&mut self.root, path.segments(), value);
        self.notify(path);
    }
}

/// Authoritative in-memory store with one client connection
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
    status_tx: watch::Sender<ConnectionStatus>,
    attach_calls: AtomicUsize,
    detach_calls: AtomicUsize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    /// A connected store with an empty tree
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);
        Self {
            state: Mutex::new(MemoryState {
                root: Value::Object(Map::new()),
                listeners: HashMap::new(),
                next_listener: 1,
                disconnect_hooks: Vec::new(),
                denied: Vec::new(),
                fail_writes: false,
                connected: true,
            }),
            status_tx,
            attach_calls: AtomicUsize::new(0),
            detach_calls: AtomicUsize::new(0),
        }
    }

    // ==================== Server side ====================

    /// Write as another client would; bypasses failure injection
    pub fn server_set(&self, path: &DataPath, value: Value) {
        self.state.lock().write(path, value);
    }

    /// Current authoritative value at `path`
    pub fn value(&self, path: &DataPath) -> Option<Value> {
        value_at(&self.state.lock().root, path)
    }

    /// Refuse reads at and around `path`
    ///
    /// Listeners already attached there receive a permission error.
    pub fn deny(&self, path: &DataPath) {
        let mut state = self.state.lock();
        state.denied.push(path.clone());
        for listener in state.listeners.values() {
            if listener.path.overlaps(path) {
                state.deliver(listener);
            }
        }
    }

    /// Lift every read rule
    pub fn allow_all(&self) {
        let mut state = self.state.lock();
        state.denied.clear();
        if state.connected {
            for listener in state.listeners.values() {
                state.deliver(listener);
            }
        }
    }

    /// Make every client write fail until turned off again
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Drop the client connection without a goodbye
    ///
    /// The server applies every registered disconnect hook, then forgets
    /// them. Listeners stay registered but see nothing until reconnect.
    pub fn simulate_disconnect(&self) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            let hooks = std::mem::take(&mut state.disconnect_hooks);
            debug!("Connection dropped, applying {} disconnect hooks", hooks.len());
            for (path, value) in hooks {
                state.write(&path, value);
            }
        }
        let _ = self.status_tx.send(ConnectionStatus::Disconnected);
    }

    /// Restore the connection; every listener gets a fresh snapshot
    pub fn simulate_reconnect(&self) {
        {
            let mut state = self.state.lock();
            if state.connected {
                return;
            }
            state.connected = true;
            let mut ids: Vec<u64> = state.listeners.keys().copied().collect();
            ids.sort();
            for id in ids {
                state.deliver(&state.listeners[&id]);
            }
        }
        let _ = self.status_tx.send(ConnectionStatus::Connected);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// How many times `attach` was called
    pub fn attach_count(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    /// How many times `detach` was called for a live listener
    pub fn detach_count(&self) -> usize {
        self.detach_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn pending_disconnect_hooks(&self) -> usize {
        self.state.lock().disconnect_hooks.len()
    }

    /// The value a disconnect would write at `path`
    pub fn disconnect_hook(&self, path: &DataPath) -> Option<Value> {
        self.state
            .lock()
            .disconnect_hooks
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn attach(&self, path: &DataPath, sink: SnapshotSink) -> ListenerHandle {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let id = state.next_listener;
        state.next_listener += 1;

        let listener = Listener {
            path: path.clone(),
            sink,
        };
        if state.connected || state.is_denied(path) {
            state.deliver(&listener);
        }
        state.listeners.insert(id, listener);
        debug!("Memory store: listener {} attached at {}", id, path);
        ListenerHandle(id)
    }

    fn detach(&self, handle: ListenerHandle) {
        if self.state.lock().listeners.remove(&handle.0).is_some() {
            self.detach_calls.fetch_add(1, Ordering::SeqCst);
            debug!("Memory store: listener {} detached", handle.0);
        }
    }

    async fn set(&self, path: &DataPath, value: Value) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(RemoteError::Offline);
        }
        if state.fail_writes {
            return Err(RemoteError::WriteRejected {
                path: path.to_string(),
                reason: "writes disabled".to_string(),
            });
        }
        if state.is_denied(path) {
            return Err(RemoteError::PermissionDenied {
                path: path.to_string(),
            });
        }
        state.write(path, value);
        Ok(())
    }

    async fn run_on_disconnect(&self, path: &DataPath, value: Value) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(RemoteError::Offline);
        }
        state.disconnect_hooks.retain(|(p, _)| p != path);
        state.disconnect_hooks.push((path.clone(), value));
        Ok(())
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}

/// Value stored at `path`, `None` when absent
fn value_at(root: &Value, path: &DataPath) -> Option<Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node.clone())
    }
}

/// Store `value` under `segments`; `Null` deletes and prunes empty parents
fn write_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    };

    if value.is_null() {
        if let Some(map) = node.as_object_mut() {
            if rest.is_empty() {
                map.remove(first);
            } else if let Some(child) = map.get_mut(first) {
                write_at(child, rest, Value::Null);
                if child.as_object().map(Map::is_empty).unwrap_or(false) {
                    map.remove(first);
                }
            }
        }
        return;
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Some(map) = node.as_object_mut() {
        let child = map
            .entry(first.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if rest.is_empty() {
            *child = value;
        } else {
            write_at(child, rest, value);
        }
    }
}
