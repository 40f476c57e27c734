//! Remote path layout
//!
//! The realtime store is a string-keyed hierarchy. Every location the sync
//! engine reads or writes is built here so the layout lives in one place:
//!
//! - `Users/{userId}`
//! - `Users Online Status/{userId}`
//! - `Direct Messages/{address(A,B)}/{messageId}`
//! - `Group Chat/{groupId}/{messageId}`
//! - `{courseCode}/ModuleContent/{moduleId}/Module Assignments/{assignmentId}`
//! - flat collections for announcements, courses, groups, attendance,
//!   screen time and notifications

use std::fmt;

use thiserror::Error;

use crate::addressing::conversation_address;
use crate::identity::UserId;

/// Characters the remote store refuses inside a key
const FORBIDDEN: &[char] = &['/', '.', '#', '$', '[', ']'];

pub const USERS: &str = "Users";
pub const PRESENCE: &str = "Users Online Status";
pub const DIRECT_MESSAGES: &str = "Direct Messages";
pub const GROUP_CHAT: &str = "Group Chat";
pub const MODULE_CONTENT: &str = "ModuleContent";
pub const MODULE_ASSIGNMENTS: &str = "Module Assignments";
pub const ANNOUNCEMENTS: &str = "Announcements";
pub const COURSES: &str = "Courses";
pub const GROUPS: &str = "Groups";
pub const ATTENDANCE: &str = "Attendance";
pub const SCREEN_TIME: &str = "Screen Time";
pub const NOTIFICATIONS: &str = "Notifications";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path segment is empty")]
    EmptySegment,

    #[error("Path segment '{segment}' contains forbidden character '{found}'")]
    ForbiddenCharacter { segment: String, found: char },
}

/// Check that `segment` can be used as a single key in the remote store
pub fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if let Some(found) = segment.chars().find(|c| FORBIDDEN.contains(c) || c.is_control()) {
        return Err(PathError::ForbiddenCharacter {
            segment: segment.to_string(),
            found,
        });
    }
    Ok(())
}

/// A validated location in the remote hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataPath {
    segments: Vec<String>,
}

impl DataPath {
    /// The root of the hierarchy
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Build a path from individual segments
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root();
        for segment in segments {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    /// Parse a slash-separated path (leading/trailing slashes ignored)
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        Self::from_segments(raw.split('/').filter(|s| !s.is_empty()))
    }

    pub fn child(&self, segment: impl Into<String>) -> Result<Self, PathError> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Last segment, `None` for the root
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `other` is this path or lies underneath it
    pub fn contains(&self, other: &DataPath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// True when one path lies on the other's branch
    pub fn overlaps(&self, other: &DataPath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

fn top(name: &str) -> DataPath {
    DataPath {
        segments: vec![name.to_string()],
    }
}

/// `Users`
pub fn users() -> DataPath {
    top(USERS)
}

/// `Users/{userId}`
pub fn user(id: &UserId) -> DataPath {
    let mut path = users();
    path.segments.push(id.as_str().to_string());
    path
}

/// `Users Online Status`
pub fn presence_root() -> DataPath {
    top(PRESENCE)
}

/// `Users Online Status/{userId}`
pub fn presence(id: &UserId) -> DataPath {
    let mut path = presence_root();
    path.segments.push(id.as_str().to_string());
    path
}

/// `Direct Messages/{address(a,b)}`
pub fn direct_messages(a: &UserId, b: &UserId) -> DataPath {
    let mut path = top(DIRECT_MESSAGES);
    path.segments.push(conversation_address(a, b));
    path
}

/// `Group Chat/{groupId}`
pub fn group_chat(group_id: &str) -> Result<DataPath, PathError> {
    top(GROUP_CHAT).child(group_id)
}

/// `{courseCode}/ModuleContent/{moduleId}/Module Assignments`
pub fn module_assignments(course_code: &str, module_id: &str) -> Result<DataPath, PathError> {
    DataPath::root()
        .child(course_code)?
        .child(MODULE_CONTENT)?
        .child(module_id)?
        .child(MODULE_ASSIGNMENTS)
}

pub fn announcements() -> DataPath {
    top(ANNOUNCEMENTS)
}

pub fn courses() -> DataPath {
    top(COURSES)
}

pub fn groups() -> DataPath {
    top(GROUPS)
}

pub fn attendance() -> DataPath {
    top(ATTENDANCE)
}

pub fn screen_time() -> DataPath {
    top(SCREEN_TIME)
}

pub fn notifications() -> DataPath {
    top(NOTIFICATIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = DataPath::parse("/Group Chat/g1/").unwrap();
        assert_eq!(path.segments().len(), 2);
        assert_eq!(path.to_string(), "Group Chat/g1");
        assert_eq!(path.key(), Some("g1"));
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        assert_eq!(
            DataPath::root().child("a.b"),
            Err(PathError::ForbiddenCharacter {
                segment: "a.b".to_string(),
                found: '.'
            })
        );
        assert_eq!(DataPath::root().child(""), Err(PathError::EmptySegment));
        assert!(DataPath::root().child("x$y").is_err());
        assert!(DataPath::root().child("ok id-1_2").is_ok());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let root = announcements();
        let child = root.child("a1").unwrap();

        assert!(root.contains(&child));
        assert!(!child.contains(&root));
        assert!(child.overlaps(&root));
        assert!(!child.overlaps(&courses()));
        assert!(DataPath::root().contains(&child));
    }

    #[test]
    fn test_parent() {
        let path = DataPath::parse("a/b/c").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "a/b");
        assert!(DataPath::root().parent().is_none());
    }

    #[test]
    fn test_layout() {
        let u1 = UserId::new("u1").unwrap();
        let u2 = UserId::new("u2").unwrap();

        assert_eq!(user(&u1).to_string(), "Users/u1");
        assert_eq!(presence(&u1).to_string(), "Users Online Status/u1");
        assert_eq!(direct_messages(&u1, &u2), direct_messages(&u2, &u1));
        assert_eq!(group_chat("g9").unwrap().to_string(), "Group Chat/g9");
        assert_eq!(
            module_assignments("CS101", "m3").unwrap().to_string(),
            "CS101/ModuleContent/m3/Module Assignments"
        );
    }
}
