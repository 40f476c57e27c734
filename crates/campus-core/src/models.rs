//! Data models
//!
//! Entities are plain records replaced by id. Field names follow the remote
//! store's camelCase JSON layout. Time-ordered entities carry either a
//! millisecond `timestamp` or a `date` + `time` pair, and order by it.

use std::collections::BTreeSet;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::UserId;

/// A record type the sync engine can mirror
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Cache namespace for this type
    const ENTITY_TYPE: &'static str;

    fn id(&self) -> &str;

    /// Sort key used when presenting a collection
    fn order_key(&self) -> String {
        self.id().to_string()
    }
}

/// A `date` + `time` reading as stored remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM:SS`
    pub time: String,
}

impl Stamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone>(at: DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            date: at.format("%Y-%m-%d").to_string(),
            time: at.format("%H:%M:%S").to_string(),
        }
    }

    /// Lexicographically sortable form
    pub fn sort_key(date: &str, time: &str) -> String {
        format!("{date}T{time}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Admin,
}

/// `Users/{userId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Role,
    /// Courses the user is enrolled in (or teaches)
    #[serde(default)]
    pub course_codes: Vec<String>,
}

impl Entity for UserProfile {
    const ENTITY_TYPE: &'static str = "users";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        self.name.to_lowercase()
    }
}

/// A chat message, direct or group
///
/// For direct chats `body` holds the Base64 ciphertext and `encrypted` is set;
/// sender and timestamp always stay in the clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(default)]
    pub encrypted: bool,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Message {
    pub fn new(id: String, sender: &UserId, body: String, encrypted: bool) -> Self {
        Self {
            id,
            sender_id: sender.to_string(),
            body,
            encrypted,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

impl Entity for Message {
    const ENTITY_TYPE: &'static str = "messages";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        format!("{:020}{}", self.timestamp.max(0), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub author_id: String,
    pub date: String,
    pub time: String,
}

impl Entity for Announcement {
    const ENTITY_TYPE: &'static str = "announcements";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        Stamp::sort_key(&self.date, &self.time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub course_code: String,
    pub module_id: String,
    /// `YYYY-MM-DD`
    pub due_date: String,
}

impl Assignment {
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        NaiveDate::parse_from_str(&self.due_date, "%Y-%m-%d")
            .map(|due| due < today)
            .unwrap_or(false)
    }
}

impl Entity for Assignment {
    const ENTITY_TYPE: &'static str = "assignments";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        format!("{}{}", self.due_date, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub lecturer: Option<String>,
}

impl Entity for Course {
    const ENTITY_TYPE: &'static str = "courses";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        self.code.clone()
    }
}

/// A group chat with an explicit member set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: BTreeSet<String>,
    pub created_by: String,
}

impl Group {
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user.as_str())
    }
}

impl Entity for Group {
    const ENTITY_TYPE: &'static str = "groups";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        self.name.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceState {
    pub id: String,
    pub course_code: String,
    pub user_id: String,
    pub present: bool,
    pub date: String,
}

impl Entity for AttendanceState {
    const ENTITY_TYPE: &'static str = "attendance";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        format!("{}{}", self.date, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenTime {
    pub id: String,
    pub user_id: String,
    pub date: String,
    pub seconds: u64,
}

impl Entity for ScreenTime {
    const ENTITY_TYPE: &'static str = "screen_time";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        format!("{}{}", self.date, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub read: bool,
}

impl Entity for Notification {
    const ENTITY_TYPE: &'static str = "notifications";

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> String {
        format!("{:020}{}", self.timestamp.max(0), self.id)
    }
}

/// `Users Online Status/{userId}`; exactly one per user, last writer wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub online: bool,
    pub last_date: String,
    pub last_time: String,
}

impl PresenceRecord {
    pub fn new(user: &UserId, online: bool, at: Stamp) -> Self {
        Self {
            user_id: user.to_string(),
            online,
            last_date: at.date,
            last_time: at.time,
        }
    }
}

impl Entity for PresenceRecord {
    const ENTITY_TYPE: &'static str = "presence";

    fn id(&self) -> &str {
        &self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let stamp = Stamp::from_datetime(at);
        assert_eq!(stamp.date, "2024-03-09");
        assert_eq!(stamp.time, "07:05:01");
    }

    #[test]
    fn test_message_json_is_camel_case() {
        let msg = Message {
            id: "m1".to_string(),
            sender_id: "u1".to_string(),
            body: "hi".to_string(),
            encrypted: false,
            timestamp: 10,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], "u1");
        assert!(json.get("sender_id").is_none());
    }

    #[test]
    fn test_message_order_by_timestamp() {
        let mut early = Message {
            id: "zzz".to_string(),
            sender_id: "u1".to_string(),
            body: String::new(),
            encrypted: false,
            timestamp: 9,
        };
        let mut late = early.clone();
        late.id = "aaa".to_string();
        late.timestamp = 100;
        assert!(early.order_key() < late.order_key());
        early.timestamp = 1000;
        assert!(early.order_key() > late.order_key());
    }

    #[test]
    fn test_presence_keyed_by_user() {
        let user = UserId::new("u5").unwrap();
        let record = PresenceRecord::new(
            &user,
            true,
            Stamp {
                date: "2024-01-01".to_string(),
                time: "10:00:00".to_string(),
            },
        );
        assert_eq!(record.id(), "u5");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["lastTime"], "10:00:00");
    }

    #[test]
    fn test_group_membership() {
        let group = Group {
            id: "g1".to_string(),
            name: "Study".to_string(),
            members: ["u1".to_string(), "u2".to_string()].into_iter().collect(),
            created_by: "u1".to_string(),
        };
        assert!(group.is_member(&UserId::new("u2").unwrap()));
        assert!(!group.is_member(&UserId::new("u3").unwrap()));
    }

    #[test]
    fn test_assignment_overdue() {
        let assignment = Assignment {
            id: "a1".to_string(),
            title: "Essay".to_string(),
            description: String::new(),
            course_code: "ENG1".to_string(),
            module_id: "m1".to_string(),
            due_date: "2024-05-01".to_string(),
        };
        let may2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let apr30 = NaiveDate::from_ymd_opt(2024, 4, 30).unwrap();
        assert!(assignment.is_overdue(may2));
        assert!(!assignment.is_overdue(apr30));
    }
}
