//! Sync engine
//!
//! Connects the remote store to the local cache:
//!
//! - `registry`: one refcounted remote listener per path, one applier task each
//! - `repository`: typed observe/save/delete per entity type
//! - `subscription`: the live collection handed to callers

mod registry;
mod repository;
mod subscription;

pub use registry::ListenerRegistry;
pub use repository::{decode_snapshot, DecodedSnapshot, SyncRepository};
pub use subscription::{Subscription, SyncStatus};
