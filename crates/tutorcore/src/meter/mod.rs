//! Voice-minute metering.
//!
//! The balance lives on the subscription record as whole milliseconds of
//! voice time; amounts are converted at this boundary. Every debit and credit
//! is a single conditional `UPDATE` scoped to one key, so callers in different
//! tasks or processes never need an in-process lock.

use sqlx::{SqliteConnection, SqlitePool};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::db::now_ms;
use crate::error::{CoreError, CoreResult};
use crate::key::{UserKey, minutes_to_ms, ms_to_minutes};

/// Atomic balance accounting for voice minutes.
#[derive(Debug, Clone)]
pub struct UsageMeter {
    pool: SqlitePool,
}

impl UsageMeter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deduct `amount` if the balance covers it.
    ///
    /// Returns `false` without changing anything when the balance is short or
    /// the user has no subscription record.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn use_voice_minutes(&self, key: &UserKey, amount: f64) -> CoreResult<bool> {
        let amount_ms = minutes_to_ms(amount)?;

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET voice_balance_ms = voice_balance_ms - ?3,
                updated_at = MAX(?4, updated_at + 1)
            WHERE bot_id = ?1 AND telegram_id = ?2 AND voice_balance_ms >= ?3
            "#,
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .bind(amount_ms)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let granted = result.rows_affected() == 1;
        if granted {
            debug!(%key, amount, "Voice minutes deducted");
        } else {
            debug!(%key, amount, "Voice minute deduction declined");
        }
        Ok(granted)
    }

    /// Credit `amount` minutes and return the new balance.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn add_minutes(&self, key: &UserKey, amount: f64) -> CoreResult<f64> {
        let mut conn = self.pool.acquire().await?;
        let balance = Self::add_minutes_on(&mut conn, key, amount, now_ms())
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subscription {key}")))?;
        info!(%key, amount, balance, "Voice minutes credited");
        Ok(balance)
    }

    /// Credit on a caller-provided connection and return the new balance in
    /// minutes. `None` means no record exists.
    pub(crate) async fn add_minutes_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
        amount: f64,
        now: i64,
    ) -> CoreResult<Option<f64>> {
        let amount_ms = minutes_to_ms(amount)?;
        let balance: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET voice_balance_ms = voice_balance_ms + ?3,
                updated_at = MAX(?4, updated_at + 1)
            WHERE bot_id = ?1 AND telegram_id = ?2
            RETURNING voice_balance_ms
            "#,
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .bind(amount_ms)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(balance.map(|b| ms_to_minutes(b.0)))
    }

    /// Current balance, or `None` when the user has no record.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn balance(&self, key: &UserKey) -> CoreResult<Option<f64>> {
        let balance: Option<(i64,)> = sqlx::query_as(
            "SELECT voice_balance_ms FROM subscriptions WHERE bot_id = ? AND telegram_id = ?",
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance.map(|b| ms_to_minutes(b.0)))
    }

    /// Run a deduction in the background and only log its outcome.
    ///
    /// Reply paths use this so they never wait on billing. The handle is
    /// returned for callers that do want to join it.
    pub fn charge_detached(&self, key: UserKey, amount: f64) -> JoinHandle<()> {
        let meter = self.clone();
        tokio::spawn(async move {
            match meter.use_voice_minutes(&key, amount).await {
                Ok(true) => {}
                Ok(false) => info!(%key, amount, "Detached charge declined: insufficient balance"),
                Err(e) => warn!(%key, amount, "Detached charge failed: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    async fn seed(pool: &SqlitePool, key: &UserKey, balance: f64) {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (bot_id, telegram_id, status, started_at, voice_balance_ms, updated_at)
            VALUES (?, ?, 'active', 0, ?, 0)
            "#,
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .bind(minutes_to_ms(balance).unwrap())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_package_credit_then_usage() {
        let db = Database::in_memory().await.unwrap();
        let meter = UsageMeter::new(db.pool().clone());
        let key = UserKey::new("bot-a", 1).unwrap();
        seed(db.pool(), &key, 0.0).await;

        assert_eq!(meter.add_minutes(&key, 100.0).await.unwrap(), 100.0);
        assert!(meter.use_voice_minutes(&key, 40.0).await.unwrap());
        assert_eq!(meter.balance(&key).await.unwrap(), Some(60.0));

        assert!(!meter.use_voice_minutes(&key, 70.0).await.unwrap());
        assert_eq!(meter.balance(&key).await.unwrap(), Some(60.0));
    }

    #[tokio::test]
    async fn test_exact_balance_is_granted() {
        let db = Database::in_memory().await.unwrap();
        let meter = UsageMeter::new(db.pool().clone());
        let key = UserKey::new("bot-a", 1).unwrap();
        seed(db.pool(), &key, 2.5).await;

        assert!(meter.use_voice_minutes(&key, 2.5).await.unwrap());
        assert_eq!(meter.balance(&key).await.unwrap(), Some(0.0));
        assert!(meter.use_voice_minutes(&key, 0.0).await.unwrap());
        assert!(!meter.use_voice_minutes(&key, 0.01).await.unwrap());
    }

    #[tokio::test]
    async fn test_fractional_deductions_use_up_balance_exactly() {
        let db = Database::in_memory().await.unwrap();
        let meter = UsageMeter::new(db.pool().clone());
        let key = UserKey::new("bot-a", 1).unwrap();
        seed(db.pool(), &key, 0.0).await;

        meter.add_minutes(&key, 0.3).await.unwrap();
        for _ in 0..3 {
            assert!(meter.use_voice_minutes(&key, 0.1).await.unwrap());
        }
        assert_eq!(meter.balance(&key).await.unwrap(), Some(0.0));

        // Six ten-second voice messages spend exactly one minute.
        meter.add_minutes(&key, 1.0).await.unwrap();
        for _ in 0..6 {
            assert!(meter.use_voice_minutes(&key, 10.0 / 60.0).await.unwrap());
        }
        assert_eq!(meter.balance(&key).await.unwrap(), Some(0.0));
        assert!(!meter.use_voice_minutes(&key, 10.0 / 60.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_record() {
        let db = Database::in_memory().await.unwrap();
        let meter = UsageMeter::new(db.pool().clone());
        let key = UserKey::new("bot-a", 1).unwrap();

        assert!(!meter.use_voice_minutes(&key, 1.0).await.unwrap());
        assert_eq!(meter.balance(&key).await.unwrap(), None);
        assert!(matches!(
            meter.add_minutes(&key, 10.0).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_amounts() {
        let db = Database::in_memory().await.unwrap();
        let meter = UsageMeter::new(db.pool().clone());
        let key = UserKey::new("bot-a", 1).unwrap();
        seed(db.pool(), &key, 10.0).await;

        assert!(matches!(
            meter.use_voice_minutes(&key, -1.0).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            meter.add_minutes(&key, f64::NAN).await,
            Err(CoreError::Validation(_))
        ));
        assert_eq!(meter.balance(&key).await.unwrap(), Some(10.0));
    }

    #[tokio::test]
    async fn test_concurrent_deductions_never_overdraw() {
        let db = Database::in_memory().await.unwrap();
        let meter = Arc::new(UsageMeter::new(db.pool().clone()));
        let key = UserKey::new("bot-a", 1).unwrap();
        seed(db.pool(), &key, 10.0).await;

        let tasks = 8;
        let barrier = Arc::new(Barrier::new(tasks));
        let mut handles = Vec::new();
        for _ in 0..tasks {
            let meter = Arc::clone(&meter);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                meter.use_voice_minutes(&key, 3.0).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(meter.balance(&key).await.unwrap(), Some(1.0));
    }

    #[tokio::test]
    async fn test_charge_detached() {
        let db = Database::in_memory().await.unwrap();
        let meter = UsageMeter::new(db.pool().clone());
        let key = UserKey::new("bot-a", 1).unwrap();
        seed(db.pool(), &key, 5.0).await;

        meter.charge_detached(key.clone(), 2.0).await.unwrap();
        meter.charge_detached(key.clone(), 9.0).await.unwrap();
        assert_eq!(meter.balance(&key).await.unwrap(), Some(3.0));
    }
}
