//! Online/offline presence
//!
//! The authoritative record lives at `Users Online Status/{userId}`. Going
//! online registers a disconnect hook that flips the record to offline if
//! the connection drops, then writes `online`. Hooks die with the
//! connection, so every regained connection registers a new one.
//!
//! The hook's `lastDate`/`lastTime` are fixed when it is registered, so
//! while online the connectivity monitor re-registers it every
//! [`HOOK_REFRESH_INTERVAL`]. After a silent drop the record is at most one
//! interval older than the moment the connection died.
//!
//! Losing connectivity only changes the local view to
//! [`PresenceView::PossiblyOffline`]; the remote record changes when the
//! server fires the hook or the client writes `offline` itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::UserId;
use crate::models::{PresenceRecord, Stamp};
use crate::paths::{self, DataPath};
use crate::remote::{ConnectionStatus, RemoteError, RemoteStore};

/// How often an online client re-stamps its disconnect hook
pub const HOOK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Signals from the app and the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// App started or came to the foreground
    Foreground,
    /// App went to the background or is stopping
    Background,
    ConnectivityRegained,
    ConnectivityLost,
}

/// What this client believes about its own presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceView {
    Online,
    /// Connection lost while foregrounded; the server has not confirmed yet
    PossiblyOffline,
    Offline,
}

struct TrackerState {
    foreground: bool,
}

pub struct PresenceTracker {
    user: UserId,
    path: DataPath,
    remote: Arc<dyn RemoteStore>,
    view_tx: watch::Sender<PresenceView>,
    hook_refresh: Duration,
    // Transitions await remote writes and must not interleave
    state: Mutex<TrackerState>,
}

impl PresenceTracker {
    pub fn new(user: UserId, remote: Arc<dyn RemoteStore>) -> Self {
        let (view_tx, _) = watch::channel(PresenceView::Offline);
        Self {
            path: paths::presence(&user),
            user,
            remote,
            view_tx,
            hook_refresh: HOOK_REFRESH_INTERVAL,
            state: Mutex::new(TrackerState { foreground: false }),
        }
    }

    pub fn with_hook_refresh(mut self, every: Duration) -> Self {
        self.hook_refresh = every;
        self
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Where this user's record lives
    pub fn path(&self) -> &DataPath {
        &self.path
    }

    pub fn view(&self) -> PresenceView {
        *self.view_tx.borrow()
    }

    pub fn watch_view(&self) -> watch::Receiver<PresenceView> {
        self.view_tx.subscribe()
    }

    pub async fn handle(&self, event: LifecycleEvent) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        debug!("Presence event {:?} for {}", event, self.user);

        match event {
            LifecycleEvent::Foreground => {
                state.foreground = true;
                self.go_online().await
            }
            LifecycleEvent::Background => {
                state.foreground = false;
                self.go_offline().await
            }
            LifecycleEvent::ConnectivityRegained => {
                if state.foreground {
                    self.go_online().await
                } else {
                    Ok(())
                }
            }
            LifecycleEvent::ConnectivityLost => {
                if state.foreground {
                    self.view_tx.send_replace(PresenceView::PossiblyOffline);
                }
                Ok(())
            }
        }
    }

    /// Re-register the disconnect hook with the current time
    ///
    /// Does nothing unless the tracker is foregrounded and online.
    pub async fn refresh_disconnect_hook(&self) -> Result<(), RemoteError> {
        let state = self.state.lock().await;
        if !state.foreground || self.view() != PresenceView::Online {
            return Ok(());
        }
        self.register_hook().await
    }

    async fn register_hook(&self) -> Result<(), RemoteError> {
        let offline = PresenceRecord::new(&self.user, false, Stamp::now());
        self.remote
            .run_on_disconnect(&self.path, to_value(&offline)?)
            .await
    }

    async fn go_online(&self) -> Result<(), RemoteError> {
        // Register the hook before claiming online
        self.register_hook().await?;

        let online = PresenceRecord::new(&self.user, true, Stamp::now());
        self.remote.set(&self.path, to_value(&online)?).await?;

        self.view_tx.send_replace(PresenceView::Online);
        info!("{} is online", self.user);
        Ok(())
    }

    async fn go_offline(&self) -> Result<(), RemoteError> {
        self.view_tx.send_replace(PresenceView::Offline);
        let offline = PresenceRecord::new(&self.user, false, Stamp::now());
        self.remote.set(&self.path, to_value(&offline)?).await?;
        info!("{} is offline", self.user);
        Ok(())
    }

    /// Follow the store's connection status and feed connectivity events
    ///
    /// Also refreshes the disconnect hook while online. The task runs until
    /// the status channel closes or the handle is aborted.
    pub fn spawn_connectivity_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = self.clone();
        let mut status = self.remote.connection_status();
        let every = self.hook_refresh.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(every);
            refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = *status.borrow_and_update();
            // The first tick completes immediately
            refresh.tick().await;
            loop {
                tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = refresh.tick() => {
                        if let Err(e) = tracker.refresh_disconnect_hook().await {
                            debug!("Could not refresh disconnect hook for {}: {}", tracker.user, e);
                        }
                        continue;
                    }
                }
                let now = *status.borrow_and_update();
                let event = match (last, now) {
                    (ConnectionStatus::Connected, ConnectionStatus::Connected) => None,
                    (ConnectionStatus::Connected, _) => Some(LifecycleEvent::ConnectivityLost),
                    (_, ConnectionStatus::Connected) => Some(LifecycleEvent::ConnectivityRegained),
                    _ => None,
                };
                last = now;

                if let Some(event) = event {
                    if let Err(e) = tracker.handle(event).await {
                        warn!("Presence update after {:?} failed: {}", event, e);
                    }
                }
            }
            debug!("Connectivity monitor for {} stopped", tracker.user);
        })
    }
}

fn to_value(record: &PresenceRecord) -> Result<serde_json::Value, RemoteError> {
    serde_json::to_value(record).map_err(|e| RemoteError::Protocol(e.to_string()))
}
