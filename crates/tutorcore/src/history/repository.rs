//! Conversation history repository.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{HistoryEntry, NewEntry, Role};
use super::window;
use crate::db::now_ms;
use crate::error::CoreResult;
use crate::key::UserKey;

const COLUMNS: &str = "id, bot_id, telegram_id, role, record_type, text_content, image_url, created_at";

/// Default character budget of a bounded window.
pub const DEFAULT_MAX_CHARS: usize = 60_000;

/// A user that has history, with the bots it talked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryUser {
    pub telegram_id: i64,
    pub bot_ids: Vec<String>,
}

/// Append-only history with bounded reads.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    pool: SqlitePool,
    max_chars: usize,
}

impl HistoryWindow {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_max_chars(pool, DEFAULT_MAX_CHARS)
    }

    pub fn with_max_chars(pool: SqlitePool, max_chars: usize) -> Self {
        Self { pool, max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Append one turn.
    #[instrument(skip(self, entry), fields(key = %key, role = %entry.role, kind = %entry.kind))]
    pub async fn append(&self, key: &UserKey, entry: NewEntry) -> CoreResult<HistoryEntry> {
        entry.validate()?;

        let sql = format!(
            r#"
            INSERT INTO records (bot_id, telegram_id, role, record_type, text_content, image_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, HistoryEntry>(&sql)
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .bind(entry.role.as_str())
            .bind(entry.kind.as_str())
            .bind(&entry.text)
            .bind(&entry.media_ref)
            .bind(now_ms())
            .fetch_one(&self.pool)
            .await?;

        debug!(id = created.id, "Appended history entry");
        Ok(created)
    }

    pub async fn append_text(
        &self,
        key: &UserKey,
        role: Role,
        text: impl Into<String>,
    ) -> CoreResult<HistoryEntry> {
        self.append(key, NewEntry::text(role, text)).await
    }

    pub async fn append_image(
        &self,
        key: &UserKey,
        role: Role,
        media_ref: impl Into<String>,
    ) -> CoreResult<HistoryEntry> {
        self.append(key, NewEntry::image(role, media_ref)).await
    }

    /// Whole history in chronological order, untrimmed.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_full(&self, key: &UserKey) -> CoreResult<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM records WHERE bot_id = ? AND telegram_id = ? ORDER BY created_at ASC, id ASC"
        );
        let entries = sqlx::query_as::<_, HistoryEntry>(&sql)
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    /// Newest contiguous suffix whose text fits in `max_chars`, falling back
    /// to the configured budget.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_bounded(
        &self,
        key: &UserKey,
        max_chars: Option<usize>,
    ) -> CoreResult<Vec<HistoryEntry>> {
        let max_chars = max_chars.unwrap_or(self.max_chars);
        let full = self.get_full(key).await?;
        let total = full.len();
        let kept = window::bounded(full, max_chars);
        if kept.len() < total {
            debug!(dropped = total - kept.len(), max_chars, "Trimmed history window");
        }
        Ok(kept)
    }

    /// The `n` most recent entries, oldest first.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_last_n(&self, key: &UserKey, n: u32) -> CoreResult<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM records WHERE bot_id = ? AND telegram_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let mut entries = sqlx::query_as::<_, HistoryEntry>(&sql)
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .bind(i64::from(n))
            .fetch_all(&self.pool)
            .await?;
        entries.reverse();
        Ok(entries)
    }

    /// Delete one user's history in one bot.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn clear_user(&self, key: &UserKey) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM records WHERE bot_id = ? AND telegram_id = ?")
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Every user with history, grouped with the bots they talked to.
    #[instrument(skip(self))]
    pub async fn list_users(&self) -> CoreResult<Vec<HistoryUser>> {
        let pairs: Vec<(i64, String)> = sqlx::query_as(
            "SELECT DISTINCT telegram_id, bot_id FROM records ORDER BY telegram_id, bot_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users: Vec<HistoryUser> = Vec::new();
        for (telegram_id, bot_id) in pairs {
            match users.last_mut() {
                Some(user) if user.telegram_id == telegram_id => user.bot_ids.push(bot_id),
                _ => users.push(HistoryUser {
                    telegram_id,
                    bot_ids: vec![bot_id],
                }),
            }
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::history::EntryKind;

    async fn setup() -> (Database, HistoryWindow, UserKey) {
        let db = Database::in_memory().await.unwrap();
        let history = HistoryWindow::new(db.pool().clone());
        (db, history, UserKey::new("bot-a", 1).unwrap())
    }

    fn texts(entries: &[HistoryEntry]) -> Vec<&str> {
        entries
            .iter()
            .map(|e| e.text_content.as_deref().unwrap_or("<image>"))
            .collect()
    }

    #[tokio::test]
    async fn test_get_last_n_is_ascending() {
        let (_db, history, key) = setup().await;
        for text in ["A", "B", "C", "D", "E"] {
            history.append_text(&key, Role::User, text).await.unwrap();
        }

        let last = history.get_last_n(&key, 3).await.unwrap();
        assert_eq!(texts(&last), vec!["C", "D", "E"]);

        let all = history.get_last_n(&key, 10).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(history.get_last_n(&key, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_bounded_keeps_suffix() {
        let (_db, history, key) = setup().await;
        for len in [100, 200, 59_800, 50] {
            history
                .append_text(&key, Role::Tutor, "x".repeat(len))
                .await
                .unwrap();
        }

        let window = history.get_bounded(&key, None).await.unwrap();
        let lengths: Vec<usize> = window.iter().map(HistoryEntry::budget_len).collect();
        assert_eq!(lengths, vec![59_800, 50]);

        let everything = history.get_bounded(&key, Some(100_000)).await.unwrap();
        assert_eq!(everything, history.get_full(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_images_and_scoping() {
        let (_db, history, key) = setup().await;
        history.append_text(&key, Role::User, "look at this").await.unwrap();
        let image = history
            .append_image(&key, Role::User, "media/1.png")
            .await
            .unwrap();
        assert_eq!(image.kind, EntryKind::Image);
        assert_eq!(image.text_content, None);

        let other_bot = UserKey::new("bot-b", 1).unwrap();
        history.append_text(&other_bot, Role::Tutor, "hi").await.unwrap();

        let full = history.get_full(&key).await.unwrap();
        assert_eq!(texts(&full), vec!["look at this", "<image>"]);

        let users = history.list_users().await.unwrap();
        assert_eq!(
            users,
            vec![HistoryUser {
                telegram_id: 1,
                bot_ids: vec!["bot-a".to_string(), "bot-b".to_string()],
            }]
        );

        assert_eq!(history.clear_user(&key).await.unwrap(), 2);
        assert!(history.get_full(&key).await.unwrap().is_empty());
        assert_eq!(history.get_full(&other_bot).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_rejects_inconsistent_entry() {
        let (_db, history, key) = setup().await;
        let entry = NewEntry {
            role: Role::User,
            kind: EntryKind::Image,
            text: Some("caption".to_string()),
            media_ref: None,
        };
        assert!(history.append(&key, entry).await.is_err());
        assert!(history.get_full(&key).await.unwrap().is_empty());
    }
}
