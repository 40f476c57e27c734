//! Generic sync repository
//!
//! One `SyncRepository<T>` per entity type, all sharing one
//! [`ListenerRegistry`]. Reads go through the cache; writes go to the cache
//! first and then to the remote store. The remote store is authoritative:
//! its next snapshot replaces whatever was written optimistically.

use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::registry::ListenerRegistry;
use super::subscription::{decode_records, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::models::Entity;
use crate::paths::DataPath;
use crate::remote::Snapshot;

/// Records of a snapshot that decode as `T`
#[derive(Debug, Default)]
pub struct DecodedSnapshot {
    /// `(child key, raw value)`, in key order
    pub records: Vec<(String, Value)>,
    pub skipped: usize,
}

/// Validate each child of `snapshot` as a `T`
///
/// A malformed child is logged and left out; it never aborts the rest. A
/// child whose `id` differs from its key is malformed too, since saves and
/// deletes address records by id.
pub fn decode_snapshot<T: Entity>(snapshot: &Snapshot) -> DecodedSnapshot {
    let mut decoded = DecodedSnapshot::default();
    for (key, value) in snapshot.children() {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(entity) if entity.id() == key => decoded.records.push((key, value)),
            Ok(entity) => {
                warn!(
                    "Skipping {} record at {}/{}: its id is '{}'",
                    T::ENTITY_TYPE,
                    snapshot.path,
                    key,
                    entity.id()
                );
                decoded.skipped += 1;
            }
            Err(e) => {
                warn!(
                    "Skipping malformed {} record '{}' at {}: {}",
                    T::ENTITY_TYPE,
                    key,
                    snapshot.path,
                    e
                );
                decoded.skipped += 1;
            }
        }
    }
    decoded
}

pub struct SyncRepository<T: Entity> {
    registry: Arc<ListenerRegistry>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for SyncRepository<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> SyncRepository<T> {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self {
            registry,
            _marker: PhantomData,
        }
    }

    /// Observe the collection stored under `path`
    ///
    /// The subscription starts with whatever is cached and follows every
    /// snapshot after that.
    pub fn observe(&self, path: &DataPath) -> SyncResult<Subscription<T>> {
        let lease = self.registry.acquire::<T>(path)?;
        let items = self
            .registry
            .cache()
            .query(T::ENTITY_TYPE, &path.to_string())?;
        Ok(Subscription::new(lease, items))
    }

    /// Cached collection under `path` without attaching a listener
    pub fn cached(&self, path: &DataPath) -> SyncResult<Vec<T>> {
        let records = self
            .registry
            .cache()
            .list(T::ENTITY_TYPE, &path.to_string())?;
        Ok(decode_records(&records))
    }

    pub fn get(&self, path: &DataPath, id: &str) -> SyncResult<Option<T>> {
        let record = self
            .registry
            .cache()
            .get(T::ENTITY_TYPE, &path.to_string(), id)?;
        match record {
            Some(record) => Ok(Some(serde_json::from_value(record.payload)?)),
            None => Ok(None),
        }
    }

    /// Write `entity` to `path/{id}`
    ///
    /// The cache is updated before the remote write. If the remote write
    /// fails the error is returned and the cached copy stays until the next
    /// snapshot corrects it.
    pub async fn save(&self, path: &DataPath, entity: &T) -> SyncResult<()> {
        let node = path.child(entity.id())?;
        let payload = serde_json::to_value(entity)?;

        self.registry.cache().upsert(
            T::ENTITY_TYPE,
            &path.to_string(),
            &[(entity.id().to_string(), payload.clone())],
        )?;
        debug!("Optimistic write of {} at {}", T::ENTITY_TYPE, node);

        if let Err(e) = self.registry.remote().set(&node, payload).await {
            warn!("Write to {} failed: {}", node, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove `path/{id}` locally and remotely
    pub async fn delete(&self, path: &DataPath, id: &str) -> SyncResult<()> {
        let node = path.child(id)?;
        self.registry
            .cache()
            .delete(T::ENTITY_TYPE, &path.to_string(), id)?;

        if let Err(e) = self.registry.remote().remove(&node).await {
            warn!("Delete of {} failed: {}", node, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Fire-and-forget [`save`](Self::save); `on_result` gets the outcome
    pub fn save_with_callback<F>(&self, path: &DataPath, entity: T, on_result: F) -> SyncResult<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let repository = self.clone();
        let path = path.clone();
        runtime.spawn(async move {
            let ok = repository.save(&path, &entity).await.is_ok();
            on_result(ok);
        });
        Ok(())
    }

    /// Fire-and-forget [`delete`](Self::delete)
    pub fn delete_with_callback<F>(&self, path: &DataPath, id: &str, on_result: F) -> SyncResult<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let repository = self.clone();
        let path = path.clone();
        let id = id.to_string();
        runtime.spawn(async move {
            let ok = repository.delete(&path, &id).await.is_ok();
            on_result(ok);
        });
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }
}
