//! Campus Core Library
//!
//! Realtime sync and offline cache engine for the campus app. Every
//! collection the app shows (courses, announcements, chats, presence) lives
//! in a remote push-based JSON store and is mirrored into a local SQLite
//! cache, which is what the app actually reads.
//!
//! # Architecture
//!
//! - **Remote store**: authoritative; pushes full snapshots of listened paths
//! - **Local cache**: SQLite mirror, observable per `(entity type, path)`
//! - **Sync repositories**: one per entity type, sharing refcounted listeners
//!
//! # Quick Start
//!
//! ```text
//! let cache = Arc::new(LocalCache::open(&config)?);
//! let remote = Arc::new(WsRemoteStore::connect(WsRemoteConfig::new(url)));
//! let session = Session::sign_in(user, remote, cache, config.listener_grace()).await;
//!
//! let mut courses = session.repository::<Course>().observe(&paths::courses())?;
//! let current = courses.current();
//! let next = courses.changed().await?;
//! ```
//!
//! # Modules
//!
//! - `session`: per-user context (main entry point)
//! - `sync`: listener registry, repositories, subscriptions
//! - `cache`: SQLite local cache
//! - `remote`: remote store trait, in-memory and WebSocket implementations
//! - `presence`: online/offline tracking with disconnect hooks
//! - `chat`, `cipher`, `key_exchange`, `addressing`: messaging
//! - `models`, `paths`, `identity`, `ids`: data model
//! - `config`: application configuration

pub mod addressing;
pub mod cache;
pub mod chat;
pub mod cipher;
pub mod config;
pub mod error;
pub mod identity;
pub mod ids;
pub mod key_exchange;
pub mod models;
pub mod paths;
pub mod presence;
pub mod remote;
pub mod session;
pub mod sync;

pub use addressing::conversation_address;
pub use cache::{CacheError, CacheStats, LocalCache};
pub use chat::{ChatError, ChatService, KeyRing, OpenedMessage};
pub use cipher::{CipherError, MessageKey};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use identity::UserId;
pub use ids::IdGenerator;
pub use key_exchange::{KeyExchangeError, KeyPayload, ScanSession};
pub use models::{Entity, Message, PresenceRecord};
pub use paths::{DataPath, PathError};
pub use presence::{LifecycleEvent, PresenceTracker, PresenceView};
pub use remote::{
    ConnectionStatus, MemoryRemoteStore, RemoteError, RemoteStore, WsRemoteConfig, WsRemoteStore,
};
pub use session::Session;
pub use sync::{Subscription, SyncRepository, SyncStatus};
