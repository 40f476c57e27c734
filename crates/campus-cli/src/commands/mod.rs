//! Command handlers

pub mod address;
pub mod config;
pub mod key;
pub mod presence;
pub mod send;
pub mod status;
pub mod watch;

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use campus_core::{Config, LocalCache, Session, UserId, WsRemoteConfig, WsRemoteStore};

/// The configured user, or a hint on how to set one
pub fn signed_in_user(config: &Config) -> Result<UserId> {
    let Some(ref id) = config.user_id else {
        bail!(
            "No user configured. Set one with:\n  \
             campus config set user_id <your-id>"
        );
    };
    UserId::new(id.clone()).map_err(|e| anyhow!("Invalid user_id '{}': {}", id, e))
}

pub fn open_cache(config: &Config) -> Result<Arc<LocalCache>> {
    let cache = LocalCache::open(config).with_context(|| {
        format!("Failed to open local cache at {:?}", config.cache_path())
    })?;
    Ok(Arc::new(cache))
}

/// Connect to the configured server and sign in
pub async fn connect(config: &Config) -> Result<Session> {
    let user = signed_in_user(config)?;
    let Some(ref url) = config.remote_url else {
        bail!(
            "Remote URL not configured. Set it with:\n  \
             campus config set remote_url ws://your-server:8080"
        );
    };

    let cache = open_cache(config)?;
    let remote = Arc::new(WsRemoteStore::connect(WsRemoteConfig::new(url.clone())));
    Ok(Session::sign_in(user, remote, cache, config.listener_grace()).await)
}
