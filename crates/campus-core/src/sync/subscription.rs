//! Live view of one mirrored collection
//!
//! A [`Subscription`] holds the current cached collection for a path and
//! the sync status of that path's listener. Dropping it (or calling
//! [`Subscription::unsubscribe`]) releases the listener.

use std::marker::PhantomData;

use tokio::sync::watch;
use tracing::warn;

use super::registry::Lease;
use crate::cache::{CacheRecord, Collection};
use crate::error::SyncResult;
use crate::models::Entity;
use crate::paths::DataPath;
use crate::remote::RemoteError;

/// Where a path's listener stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Attached, waiting for the first snapshot; cached data may be stale
    Pending,
    /// The last snapshot was applied
    Live,
    /// The listener reported an error; the collection is the last known good one
    Error(String),
}

impl SyncStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, SyncStatus::Live)
    }
}

pub struct Subscription<T: Entity> {
    lease: Lease,
    items: watch::Receiver<Collection>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Subscription<T> {
    pub(crate) fn new(lease: Lease, items: watch::Receiver<Collection>) -> Self {
        Self {
            lease,
            items,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &DataPath {
        self.lease.path()
    }

    /// Current collection, in presentation order
    pub fn current(&self) -> Vec<T> {
        decode_records(&self.items.borrow())
    }

    /// Wait for the next change and return the new collection
    pub async fn changed(&mut self) -> SyncResult<Vec<T>> {
        self.items
            .changed()
            .await
            .map_err(|_| RemoteError::Closed)?;
        Ok(decode_records(&self.items.borrow_and_update()))
    }

    /// Wait until the collection satisfies `pred`
    pub async fn wait_for<F>(&mut self, mut pred: F) -> SyncResult<Vec<T>>
    where
        F: FnMut(&[T]) -> bool,
    {
        let mut items = decode_records(&self.items.borrow_and_update());
        loop {
            if pred(&items) {
                return Ok(items);
            }
            items = self.changed().await?;
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.lease.status().borrow().clone()
    }

    /// Wait until the listener leaves [`SyncStatus::Pending`]
    pub async fn synced(&mut self) -> SyncResult<SyncStatus> {
        let status = self
            .lease
            .status_mut()
            .wait_for(|s| *s != SyncStatus::Pending)
            .await
            .map_err(|_| RemoteError::Closed)?;
        Ok(status.clone())
    }

    /// Wait for the next status change
    pub async fn status_changed(&mut self) -> SyncResult<SyncStatus> {
        let status = self.lease.status_mut();
        status.changed().await.map_err(|_| RemoteError::Closed)?;
        let current = status.borrow_and_update().clone();
        Ok(current)
    }

    pub fn unsubscribe(mut self) {
        self.lease.release();
    }
}

/// Decode cached payloads, skipping anything that no longer fits `T`
pub(crate) fn decode_records<T: Entity>(records: &[CacheRecord]) -> Vec<T> {
    let mut items: Vec<T> = records
        .iter()
        .filter_map(|record| match serde_json::from_value::<T>(record.payload.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(
                    "Cached {} record '{}' does not decode: {}",
                    T::ENTITY_TYPE,
                    record.id,
                    e
                );
                None
            }
        })
        .collect();
    items.sort_by(|a, b| {
        a.order_key()
            .cmp(&b.order_key())
            .then_with(|| a.id().cmp(b.id()))
    });
    items
}
