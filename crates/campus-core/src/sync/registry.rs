//! Process-wide listener table
//!
//! At most one remote listener is attached per path, no matter how many
//! subscriptions observe it. Each entry counts its subscribers; when the
//! count drops to zero the listener is detached after a grace delay, unless
//! somebody subscribes again first.
//!
//! Every attached path has exactly one applier task. It drains the
//! listener's events in emission order and reconciles the cache with each
//! snapshot, so there is a single writer per path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::repository::decode_snapshot;
use super::subscription::SyncStatus;
use crate::cache::LocalCache;
use crate::error::{SyncError, SyncResult};
use crate::models::Entity;
use crate::paths::DataPath;
use crate::remote::{ListenerHandle, RemoteEvent, RemoteStore};

struct Entry {
    /// Distinguishes this attachment from earlier ones at the same path
    id: u64,
    entity_type: &'static str,
    handle: ListenerHandle,
    subscribers: usize,
    /// Bumped on every acquire so a pending delayed detach can tell it is stale
    generation: u64,
    status_tx: watch::Sender<SyncStatus>,
    applier: JoinHandle<()>,
}

pub struct ListenerRegistry {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    grace: Duration,
    entries: Mutex<HashMap<DataPath, Entry>>,
    next_entry: AtomicU64,
}

impl ListenerRegistry {
    /// `grace` is how long an unobserved listener stays attached
    pub fn new(remote: Arc<dyn RemoteStore>, cache: Arc<LocalCache>, grace: Duration) -> Self {
        Self {
            remote,
            cache,
            grace,
            entries: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(1),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Register one more subscriber for `path`, attaching if needed
    pub(crate) fn acquire<T: Entity>(self: &Arc<Self>, path: &DataPath) -> SyncResult<Lease> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(path) {
            if entry.entity_type != T::ENTITY_TYPE {
                return Err(SyncError::PathTypeConflict {
                    path: path.to_string(),
                    existing: entry.entity_type,
                    requested: T::ENTITY_TYPE,
                });
            }
            entry.subscribers += 1;
            entry.generation += 1;
            debug!("Reusing listener at {} ({} subscribers)", path, entry.subscribers);
            return Ok(Lease::new(
                self.clone(),
                path.clone(),
                entry.id,
                entry.status_tx.subscribe(),
            ));
        }

        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let (sink, events) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Pending);

        let applier = runtime.spawn(apply_events::<T>(
            path.clone(),
            events,
            self.cache.clone(),
            status_tx.clone(),
        ));
        let handle = self.remote.attach(path, sink);
        debug!("Attached listener {} at {}", handle.0, path);

        let id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            path.clone(),
            Entry {
                id,
                entity_type: T::ENTITY_TYPE,
                handle,
                subscribers: 1,
                generation: 0,
                status_tx,
                applier,
            },
        );
        Ok(Lease::new(self.clone(), path.clone(), id, status_rx))
    }

    /// Drop one subscriber of entry `entry_id` at `path`
    ///
    /// Leases that outlived their entry (detached by `shutdown`) are ignored.
    fn release(self: &Arc<Self>, path: &DataPath, entry_id: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(path).filter(|e| e.id == entry_id) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return;
        }

        let generation = entry.generation;
        let runtime = match Handle::try_current() {
            Ok(runtime) if !self.grace.is_zero() => runtime,
            _ => {
                self.detach_locked(&mut entries, path);
                return;
            }
        };
        drop(entries);

        let registry = self.clone();
        let path = path.clone();
        let grace = self.grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            registry.detach_if_idle(&path, entry_id, generation);
        });
    }

    fn detach_if_idle(&self, path: &DataPath, entry_id: u64, generation: u64) {
        let mut entries = self.entries.lock();
        let idle = entries
            .get(path)
            .map(|e| e.id == entry_id && e.subscribers == 0 && e.generation == generation)
            .unwrap_or(false);
        if idle {
            self.detach_locked(&mut entries, path);
        }
    }

    fn detach_locked(&self, entries: &mut HashMap<DataPath, Entry>, path: &DataPath) {
        if let Some(entry) = entries.remove(path) {
            self.remote.detach(entry.handle);
            entry.applier.abort();
            debug!("Detached listener {} at {}", entry.handle.0, path);
        }
    }

    /// Detach every listener immediately, subscribed or not
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock();
        let paths: Vec<DataPath> = entries.keys().cloned().collect();
        for path in paths {
            self.detach_locked(&mut entries, &path);
        }
    }

    pub fn is_attached(&self, path: &DataPath) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn subscriber_count(&self, path: &DataPath) -> usize {
        self.entries
            .lock()
            .get(path)
            .map(|e| e.subscribers)
            .unwrap_or(0)
    }

    pub fn attached_paths(&self) -> Vec<DataPath> {
        let mut paths: Vec<DataPath> = self.entries.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

/// One subscriber's claim on a path; released on drop
pub(crate) struct Lease {
    registry: Arc<ListenerRegistry>,
    path: DataPath,
    entry_id: u64,
    status: watch::Receiver<SyncStatus>,
    released: bool,
}

impl Lease {
    fn new(
        registry: Arc<ListenerRegistry>,
        path: DataPath,
        entry_id: u64,
        status: watch::Receiver<SyncStatus>,
    ) -> Self {
        Self {
            registry,
            path,
            entry_id,
            status,
            released: false,
        }
    }

    pub(crate) fn path(&self) -> &DataPath {
        &self.path
    }

    pub(crate) fn status(&self) -> &watch::Receiver<SyncStatus> {
        &self.status
    }

    pub(crate) fn status_mut(&mut self) -> &mut watch::Receiver<SyncStatus> {
        &mut self.status
    }

    pub(crate) fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.path, self.entry_id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Apply a listener's events to the cache, in order
async fn apply_events<T: Entity>(
    path: DataPath,
    mut events: mpsc::UnboundedReceiver<RemoteEvent>,
    cache: Arc<LocalCache>,
    status: watch::Sender<SyncStatus>,
) {
    let parent_key = path.to_string();
    while let Some(event) = events.recv().await {
        match event {
            RemoteEvent::Snapshot(snapshot) => {
                let decoded = decode_snapshot::<T>(&snapshot);
                match cache.replace_all(T::ENTITY_TYPE, &parent_key, &decoded.records) {
                    Ok(summary) => {
                        debug!(
                            "Applied snapshot at {}: {} records (+{} ~{} -{}), {} skipped",
                            parent_key,
                            decoded.records.len(),
                            summary.inserted,
                            summary.updated,
                            summary.removed,
                            decoded.skipped
                        );
                        status.send_replace(SyncStatus::Live);
                    }
                    Err(e) => {
                        warn!("Failed to cache snapshot at {}: {}", parent_key, e);
                        status.send_replace(SyncStatus::Error(e.to_string()));
                    }
                }
            }
            RemoteEvent::Error(e) => {
                warn!("Listener at {} reported an error: {}", parent_key, e);
                status.send_replace(SyncStatus::Error(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Course, Group};
    use crate::remote::MemoryRemoteStore;

    fn setup(grace: Duration) -> (Arc<MemoryRemoteStore>, Arc<ListenerRegistry>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(LocalCache::open_in_memory().unwrap());
        let registry = Arc::new(ListenerRegistry::new(remote.clone(), cache, grace));
        (remote, registry)
    }

    #[tokio::test]
    async fn test_n_acquires_one_attach() {
        let (remote, registry) = setup(Duration::ZERO);
        let path = crate::paths::courses();

        let leases: Vec<Lease> = (0..5)
            .map(|_| registry.acquire::<Course>(&path).unwrap())
            .collect();
        assert_eq!(remote.attach_count(), 1);
        assert_eq!(registry.subscriber_count(&path), 5);

        drop(leases);
        assert_eq!(remote.detach_count(), 1);
        assert!(!registry.is_attached(&path));
    }

    #[tokio::test]
    async fn test_type_conflict() {
        let (_remote, registry) = setup(Duration::ZERO);
        let path = crate::paths::groups();
        let _lease = registry.acquire::<Group>(&path).unwrap();

        assert!(matches!(
            registry.acquire::<Course>(&path),
            Err(SyncError::PathTypeConflict { existing: "groups", requested: "courses", .. })
        ));
    }

    #[tokio::test]
    async fn test_grace_delay_keeps_listener() {
        let (remote, registry) = setup(Duration::from_millis(100));
        let path = crate::paths::courses();

        drop(registry.acquire::<Course>(&path).unwrap());
        assert!(registry.is_attached(&path));

        // Back within the grace period: no second attach, pending detach cancelled
        let lease = registry.acquire::<Course>(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(registry.is_attached(&path));
        assert_eq!(remote.attach_count(), 1);
        assert_eq!(remote.detach_count(), 0);

        drop(lease);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!registry.is_attached(&path));
        assert_eq!(remote.detach_count(), 1);
    }

    #[test]
    fn test_acquire_outside_runtime() {
        let (_remote, registry) = setup(Duration::ZERO);
        assert!(matches!(
            registry.acquire::<Course>(&crate::paths::courses()),
            Err(SyncError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_detaches_everything() {
        let (remote, registry) = setup(Duration::from_secs(60));
        let _a = registry.acquire::<Course>(&crate::paths::courses()).unwrap();
        let _b = registry.acquire::<Group>(&crate::paths::groups()).unwrap();

        registry.shutdown();
        assert_eq!(remote.listener_count(), 0);
        assert!(registry.attached_paths().is_empty());
    }

    #[tokio::test]
    async fn test_lease_from_before_shutdown_leaves_new_entry_alone() {
        let (remote, registry) = setup(Duration::ZERO);
        let path = crate::paths::courses();
        let stale = registry.acquire::<Course>(&path).unwrap();

        registry.shutdown();
        let fresh = registry.acquire::<Course>(&path).unwrap();
        assert_eq!(remote.attach_count(), 2);

        drop(stale);
        assert!(registry.is_attached(&path));
        assert_eq!(registry.subscriber_count(&path), 1);
        assert_eq!(remote.listener_count(), 1);

        drop(fresh);
        assert!(!registry.is_attached(&path));
        assert_eq!(remote.listener_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_release_keeps_count() {
        let (remote, registry) = setup(Duration::ZERO);
        let path = crate::paths::courses();
        let base = registry.acquire::<Course>(&path).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let lease = registry.acquire::<Course>(&path).unwrap();
                        tokio::task::yield_now().await;
                        drop(lease);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(remote.attach_count(), 1);
        assert_eq!(registry.subscriber_count(&path), 1);

        drop(base);
        assert_eq!(remote.detach_count(), 1);
        assert!(!registry.is_attached(&path));
    }
}
