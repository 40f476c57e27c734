//! Signed-in user context
//!
//! A [`Session`] owns everything that belongs to one signed-in user: the
//! listener registry, the presence tracker and its connectivity monitor,
//! and the chat service. Repositories handed out by the session share its
//! registry, so two screens observing the same path share one listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::LocalCache;
use crate::chat::{ChatService, KeyRing};
use crate::ids::IdGenerator;
use crate::identity::UserId;
use crate::models::Entity;
use crate::presence::{LifecycleEvent, PresenceTracker};
use crate::remote::{RemoteError, RemoteStore};
use crate::sync::{ListenerRegistry, SyncRepository};

pub struct Session {
    user: UserId,
    registry: Arc<ListenerRegistry>,
    presence: Arc<PresenceTracker>,
    chat: ChatService,
    monitor: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session for `user` and announce presence
    ///
    /// A failed presence write does not fail the sign-in; the connectivity
    /// monitor retries once the connection comes back.
    pub async fn sign_in(
        user: UserId,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        grace: Duration,
    ) -> Self {
        let registry = Arc::new(ListenerRegistry::new(remote.clone(), cache.clone(), grace));
        let presence = Arc::new(PresenceTracker::new(user.clone(), remote));
        let chat = ChatService::new(
            user.clone(),
            SyncRepository::new(registry.clone()),
            KeyRing::new(cache, &user),
        );

        // Monitor first so a connection that comes up mid sign-in is seen
        let monitor = presence.spawn_connectivity_monitor();
        if let Err(e) = presence.handle(LifecycleEvent::Foreground).await {
            warn!("Could not announce presence for {}: {}", user, e);
        }
        info!("Signed in as {}", user);

        Self {
            user,
            registry,
            presence,
            chat,
            monitor: Some(monitor),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Typed repository sharing this session's listeners
    pub fn repository<T: Entity>(&self) -> SyncRepository<T> {
        SyncRepository::new(self.registry.clone())
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        self.registry.cache()
    }

    pub fn next_id(&self) -> String {
        IdGenerator::global().next_id()
    }

    /// Write `offline` and release every listener
    ///
    /// Listeners are released even when the offline write fails.
    pub async fn sign_out(mut self) -> Result<(), RemoteError> {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        let result = self.presence.handle(LifecycleEvent::Background).await;
        self.registry.shutdown();
        info!("Signed out {}", self.user);
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.registry.shutdown();
    }
}
