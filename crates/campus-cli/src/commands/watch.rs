//! Watch command handler

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Local};
use clap::ValueEnum;

use campus_core::models::{
    Announcement, Assignment, AttendanceState, Course, Group, Notification, PresenceRecord,
    ScreenTime, UserProfile,
};
use campus_core::{paths, ChatService, Entity, Message, Subscription, SyncStatus, UserId};

use super::connect;
use crate::output::Output;

/// How long to wait for the first snapshot before printing cached data anyway
const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WatchKind {
    Users,
    Presence,
    Announcements,
    Courses,
    Groups,
    Attendance,
    ScreenTime,
    Notifications,
    Assignments,
    Direct,
    GroupChat,
}

pub async fn watch(
    config: &campus_core::Config,
    kind: WatchKind,
    parent: Option<&str>,
    output: &Output,
) -> Result<()> {
    let session = connect(config).await?;

    let result = match kind {
        WatchKind::Users => {
            let sub = session.repository::<UserProfile>().observe(&paths::users())?;
            follow(sub, "Users", output, as_json).await
        }
        WatchKind::Presence => {
            let sub = session
                .repository::<PresenceRecord>()
                .observe(&paths::presence_root())?;
            follow(sub, "Presence", output, |p| {
                let state = if p.online { "online" } else { "offline" };
                format!("{:<20} {:<8} since {} {}", p.user_id, state, p.last_date, p.last_time)
            })
            .await
        }
        WatchKind::Announcements => {
            let sub = session
                .repository::<Announcement>()
                .observe(&paths::announcements())?;
            follow(sub, "Announcements", output, |a| {
                format!("{} {}  {}: {}", a.date, a.time, a.title, a.body)
            })
            .await
        }
        WatchKind::Courses => {
            let sub = session.repository::<Course>().observe(&paths::courses())?;
            follow(sub, "Courses", output, as_json).await
        }
        WatchKind::Groups => {
            let sub = session.repository::<Group>().observe(&paths::groups())?;
            follow(sub, "Groups", output, |g| {
                format!("{:<20} {} ({} members)", g.id, g.name, g.members.len())
            })
            .await
        }
        WatchKind::Attendance => {
            let sub = session
                .repository::<AttendanceState>()
                .observe(&paths::attendance())?;
            follow(sub, "Attendance", output, as_json).await
        }
        WatchKind::ScreenTime => {
            let sub = session
                .repository::<ScreenTime>()
                .observe(&paths::screen_time())?;
            follow(sub, "Screen time", output, as_json).await
        }
        WatchKind::Notifications => {
            let sub = session
                .repository::<Notification>()
                .observe(&paths::notifications())?;
            follow(sub, "Notifications", output, as_json).await
        }
        WatchKind::Assignments => {
            let parent = require_parent(parent, "COURSE/MODULE")?;
            let Some((course, module)) = parent.split_once('/') else {
                bail!("Assignments need --parent COURSE/MODULE, got '{}'", parent);
            };
            let sub = session
                .repository::<Assignment>()
                .observe(&paths::module_assignments(course, module)?)?;
            follow(sub, "Assignments", output, as_json).await
        }
        WatchKind::Direct => {
            let peer = require_parent(parent, "peer id")?;
            let peer = UserId::new(peer).map_err(|e| anyhow!("Invalid user id '{}': {}", peer, e))?;
            let chat = session.chat();
            let address = chat.address_with(&peer);
            let sub = chat.observe_direct(&peer)?;
            follow(sub, &format!("Conversation {}", address), output, |m| {
                format_message(chat, &address, m)
            })
            .await
        }
        WatchKind::GroupChat => {
            let group_id = require_parent(parent, "group id")?;
            let chat = session.chat();
            let sub = chat.observe_group(group_id)?;
            follow(sub, &format!("Group {}", group_id), output, |m| {
                format_message(chat, group_id, m)
            })
            .await
        }
    };

    if let Err(e) = session.sign_out().await {
        output.warn(&format!("Could not go offline cleanly: {}", e));
    }
    result
}

/// Print the collection now and after every change until Ctrl-C
async fn follow<T, R>(
    mut sub: Subscription<T>,
    label: &str,
    output: &Output,
    render: R,
) -> Result<()>
where
    T: Entity,
    R: Fn(&T) -> String,
{
    match tokio::time::timeout(FIRST_SNAPSHOT_TIMEOUT, sub.synced()).await {
        Ok(Ok(SyncStatus::Error(message))) => {
            output.warn(&format!("{} is not syncing: {}", sub.path(), message))
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => output.warn("No snapshot from the server yet, showing cached data"),
    }

    let ids = |item: &T| item.id().to_string();
    output.print_collection(label, &sub.current(), &render, ids);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = sub.changed() => {
                let items = changed?;
                output.print_collection(label, &items, &render, ids);
            }
        }
    }
    Ok(())
}

fn require_parent<'a>(parent: Option<&'a str>, what: &str) -> Result<&'a str> {
    parent.ok_or_else(|| anyhow!("This collection needs --parent <{}>", what))
}

fn as_json<T: Entity>(item: &T) -> String {
    serde_json::to_string(item).unwrap_or_else(|_| item.id().to_string())
}

/// `[HH:MM:SS] sender: text`, decrypting direct messages
pub fn format_message(chat: &ChatService, address: &str, message: &Message) -> String {
    let at = DateTime::from_timestamp_millis(message.timestamp)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let opened = chat.open(address, message);
    format!("[{}] {}: {}", at, message.sender_id, opened.text())
}
