//! History data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{CoreError, CoreResult};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Tutor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Tutor => "tutor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "tutor" => Ok(Role::Tutor),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Payload kind of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Text,
    Image,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Text => "text",
            EntryKind::Image => "image",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(EntryKind::Text),
            "image" => Ok(EntryKind::Image),
            _ => Err(format!("unknown record type: {}", s)),
        }
    }
}

impl TryFrom<String> for EntryKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One immutable conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub bot_id: String,
    pub telegram_id: i64,
    #[sqlx(try_from = "String")]
    pub role: Role,
    #[sqlx(rename = "record_type", try_from = "String")]
    #[serde(rename = "record_type")]
    pub kind: EntryKind,
    pub text_content: Option<String>,
    /// Reference to the stored media object.
    pub image_url: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl HistoryEntry {
    /// Length counted against the window budget. Images count zero.
    pub fn budget_len(&self) -> usize {
        self.text_content
            .as_deref()
            .map(|t| t.chars().count())
            .unwrap_or(0)
    }
}

/// A turn to append.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewEntry {
    pub role: Role,
    pub kind: EntryKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
}

impl NewEntry {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            kind: EntryKind::Text,
            text: Some(text.into()),
            media_ref: None,
        }
    }

    pub fn image(role: Role, media_ref: impl Into<String>) -> Self {
        Self {
            role,
            kind: EntryKind::Image,
            text: None,
            media_ref: Some(media_ref.into()),
        }
    }

    /// Text is present iff the kind is text; a media reference iff image.
    pub fn validate(&self) -> CoreResult<()> {
        match (self.kind, &self.text, &self.media_ref) {
            (EntryKind::Text, Some(_), None) => Ok(()),
            (EntryKind::Image, None, Some(media)) if !media.trim().is_empty() => Ok(()),
            (EntryKind::Image, None, Some(_)) => {
                Err(CoreError::validation("image entry needs a non-empty media reference"))
            }
            (kind, _, _) => Err(CoreError::validation(format!(
                "{kind} entry must carry exactly its own payload"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_validation() {
        assert!(NewEntry::text(Role::User, "hello").validate().is_ok());
        assert!(NewEntry::text(Role::Tutor, "").validate().is_ok());
        assert!(NewEntry::image(Role::User, "s3://bucket/a.png").validate().is_ok());
        assert!(NewEntry::image(Role::User, "  ").validate().is_err());

        let mixed = NewEntry {
            role: Role::User,
            kind: EntryKind::Text,
            text: Some("hi".to_string()),
            media_ref: Some("s3://bucket/a.png".to_string()),
        };
        assert!(matches!(mixed.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_budget_len_counts_chars() {
        let entry = HistoryEntry {
            id: 1,
            bot_id: "bot-a".to_string(),
            telegram_id: 1,
            role: Role::User,
            kind: EntryKind::Text,
            text_content: Some("привет".to_string()),
            image_url: None,
            created_at: 0,
        };
        assert_eq!(entry.budget_len(), 6);
    }
}
