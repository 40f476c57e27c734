//! Send command handlers

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use campus_core::models::Group;
use campus_core::{paths, ChatError, Config, Message, Session, UserId};

use super::connect;
use crate::output::{Output, OutputFormat};

const GROUP_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Send an encrypted direct message
pub async fn direct(config: &Config, peer: &str, text: &str, output: &Output) -> Result<()> {
    let peer = UserId::new(peer).map_err(|e| anyhow!("Invalid user id '{}': {}", peer, e))?;
    let session = connect(config).await?;

    let sent = session.chat().send_direct(&peer, text).await;
    let sent = match sent {
        Err(ChatError::MissingKey { address }) => {
            let _ = session.sign_out().await;
            bail!(
                "No key exchanged with {} yet (conversation {}). Share one with:\n  \
                 campus key share {}",
                peer,
                address,
                peer
            );
        }
        other => other,
    };
    finish(session, sent.map_err(Into::into), output).await
}

/// Send a plaintext message to a group the user belongs to
pub async fn group(config: &Config, group_id: &str, text: &str, output: &Output) -> Result<()> {
    let session = connect(config).await?;
    let sent = match find_group(&session, group_id).await {
        Ok(group) => session
            .chat()
            .send_group(&group, text)
            .await
            .map_err(Into::into),
        Err(e) => Err(e),
    };
    finish(session, sent, output).await
}

async fn find_group(session: &Session, group_id: &str) -> Result<Group> {
    let mut groups = session.repository::<Group>().observe(&paths::groups())?;
    // Fall back to the cache when the server is slow
    let _ = tokio::time::timeout(GROUP_LOOKUP_TIMEOUT, groups.synced()).await;

    groups
        .current()
        .into_iter()
        .find(|g| g.id == group_id)
        .with_context(|| format!("Unknown group '{}'", group_id))
}

async fn finish(session: Session, sent: Result<Message>, output: &Output) -> Result<()> {
    if let Err(e) = session.sign_out().await {
        output.warn(&format!("Could not go offline cleanly: {}", e));
    }
    let message = sent?;

    match output.format {
        OutputFormat::Json => output.json(&message),
        OutputFormat::Quiet => println!("{}", message.id),
        OutputFormat::Human => output.success(&format!("Sent message {}", message.id)),
    }
    Ok(())
}
