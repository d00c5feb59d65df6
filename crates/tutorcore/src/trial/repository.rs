//! Trial grant repository.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use crate::db::now_ms;
use crate::error::CoreResult;
use crate::key::UserKey;

/// Atomic insert-if-absent gate over `trial_usages`.
#[derive(Debug, Clone)]
pub struct TrialGate {
    pool: SqlitePool,
}

impl TrialGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether the user already consumed the trial of this bot.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn has_claimed(&self, key: &UserKey) -> CoreResult<bool> {
        let claimed: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM trial_usages WHERE bot_id = ? AND telegram_id = ?",
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    /// Claim the trial. Returns `true` only for the call that created the grant.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn claim(&self, key: &UserKey) -> CoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::claim_on(&mut conn, key, now_ms()).await
    }

    /// Claim on a caller-provided connection, so the grant can share a
    /// transaction with the subscription change it unlocks.
    pub(crate) async fn claim_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
        now: i64,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trial_usages (bot_id, telegram_id, claimed_at)
            VALUES (?, ?, ?)
            ON CONFLICT (bot_id, telegram_id) DO NOTHING
            "#,
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let granted = result.rows_affected() == 1;
        debug!(%key, granted, "Trial claim");
        Ok(granted)
    }

    /// Administrative reset: forget that the trial was consumed.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn revoke(&self, key: &UserKey) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM trial_usages WHERE bot_id = ? AND telegram_id = ?")
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
