//! Presence command handler

use anyhow::{Context, Result};

use campus_core::{Config, PresenceView};

use super::connect;
use crate::output::Output;

/// Stay online until Ctrl-C, reporting every change of the local view
pub async fn run(config: &Config, output: &Output) -> Result<()> {
    let session = connect(config).await?;
    let mut view = session.presence().watch_view();
    output.message(&format!(
        "{} is {} (Ctrl-C to go offline)",
        session.user(),
        describe(*view.borrow_and_update())
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *view.borrow_and_update();
                output.message(&format!("{} is {}", session.user(), describe(current)));
            }
        }
    }

    session.sign_out().await.context("Failed to go offline")?;
    output.success("Offline");
    Ok(())
}

fn describe(view: PresenceView) -> &'static str {
    match view {
        PresenceView::Online => "online",
        PresenceView::PossiblyOffline => "possibly offline (reconnecting)",
        PresenceView::Offline => "offline",
    }
}
