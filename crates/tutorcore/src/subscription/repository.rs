//! Subscription repository.
//!
//! Each transition is one conditional statement whose `WHERE` clause names
//! the states it may start from. Callers learn whether it applied from the
//! affected row count, never from an earlier read.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use super::models::{Activation, SubscriptionRecord, SubscriptionStatus};
use crate::catalog::TariffPlan;
use crate::error::{CoreError, CoreResult};
use crate::key::{MS_PER_MINUTE, UserKey, minutes_to_ms};

const COLUMNS: &str = "id, bot_id, telegram_id, plan_id, status, started_at, expires_at, \
    voice_balance_ms / 60000.0 AS voice_minutes_balance, payment_id, updated_at";

/// `pending -> active`, also accepting a swept pending record that never
/// reached a paid period. `?1` is the current time; the key filter is appended.
const ACTIVATE: &str = r#"
    UPDATE subscriptions
    SET status = 'active',
        started_at = ?1,
        expires_at = (
            SELECT CASE WHEN p.duration_minutes > 0 THEN ?1 + p.duration_minutes * 60000 END
            FROM tariff_plans p WHERE p.id = subscriptions.plan_id
        ),
        voice_balance_ms = voice_balance_ms + COALESCE(
            (SELECT CAST(ROUND(p.voice_minutes * 60000) AS INTEGER) FROM tariff_plans p WHERE p.id = subscriptions.plan_id), 0
        ),
        updated_at = MAX(?1, updated_at + 1)
    WHERE (status = 'pending' OR (status = 'expired' AND expires_at IS NULL))
"#;

/// Repository for subscription records.
#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the record for a key.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &UserKey) -> CoreResult<Option<SubscriptionRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_on(&mut conn, key).await
    }

    pub(crate) async fn get_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
    ) -> CoreResult<Option<SubscriptionRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE bot_id = ? AND telegram_id = ?");
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    async fn get_by_payment_on(
        conn: &mut SqliteConnection,
        payment_id: &str,
    ) -> CoreResult<Option<SubscriptionRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE payment_id = ? ORDER BY id LIMIT 1");
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(payment_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    /// List every record, newest change first.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> CoreResult<Vec<SubscriptionRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions ORDER BY updated_at DESC, id DESC");
        let records = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Enter `pending` for the given plan. Never overwrites an active record;
    /// `None` means the existing record was active and nothing changed. The
    /// voice-minute balance survives re-entry.
    pub(crate) async fn create_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
        plan_id: i64,
        payment_id: Option<&str>,
        now: i64,
    ) -> CoreResult<Option<i64>> {
        let id: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (bot_id, telegram_id, plan_id, status, started_at, expires_at, voice_balance_ms, payment_id, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?5, NULL, 0, ?4, ?5)
            ON CONFLICT (bot_id, telegram_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                status = 'pending',
                started_at = excluded.started_at,
                expires_at = NULL,
                payment_id = excluded.payment_id,
                updated_at = MAX(excluded.updated_at, subscriptions.updated_at + 1)
            WHERE subscriptions.status != 'active'
            RETURNING id
            "#,
        )
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .bind(plan_id)
        .bind(payment_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(id.map(|row| row.0))
    }

    /// Activate by key and classify the outcome.
    pub(crate) async fn activate_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
        now: i64,
    ) -> CoreResult<Activation> {
        let sql = format!("{ACTIVATE} AND bot_id = ?2 AND telegram_id = ?3");
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 1 {
            debug!(%key, "Subscription activated");
            return Ok(Activation::Activated);
        }

        let current = Self::get_on(conn, key).await?;
        classify_activation(current, || format!("subscription {key}"))
    }

    /// Activate the record created for a provider payment.
    pub(crate) async fn activate_by_payment_on(
        conn: &mut SqliteConnection,
        payment_id: &str,
        now: i64,
    ) -> CoreResult<Activation> {
        let sql = format!("{ACTIVATE} AND payment_id = ?2");
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(payment_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() >= 1 {
            debug!(payment_id, "Subscription activated by payment");
            return Ok(Activation::Activated);
        }

        let current = Self::get_by_payment_on(conn, payment_id).await?;
        classify_activation(current, || format!("subscription for payment '{payment_id}'"))
    }

    /// Activate the cycle a confirmed payment was made for.
    ///
    /// The record carrying `payment_id` is preferred and must belong to `key`.
    /// When no record carries it, the key's current record is activated.
    pub(crate) async fn activate_for_payment_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
        payment_id: &str,
        now: i64,
    ) -> CoreResult<Activation> {
        match Self::get_by_payment_on(conn, payment_id).await? {
            Some(record) if record.bot_id != key.bot_id || record.telegram_id != key.telegram_id => {
                Err(CoreError::validation(format!(
                    "payment '{payment_id}' belongs to {}/{}, not {key}",
                    record.bot_id, record.telegram_id
                )))
            }
            Some(_) => Self::activate_by_payment_on(conn, payment_id, now).await,
            None => {
                debug!(%key, payment_id, "No record carries the payment id, activating by key");
                Self::activate_on(conn, key, now).await
            }
        }
    }

    /// Move the record into `trial` using the trial plan's terms. `None`
    /// means the record is active and was left alone.
    pub(crate) async fn start_trial_on(
        conn: &mut SqliteConnection,
        key: &UserKey,
        plan: &TariffPlan,
        now: i64,
    ) -> CoreResult<Option<SubscriptionRecord>> {
        let expires_at = match plan.duration_minutes {
            minutes if minutes <= 0 => None,
            minutes => Some(
                minutes
                    .checked_mul(MS_PER_MINUTE)
                    .and_then(|ms| now.checked_add(ms))
                    .ok_or_else(|| {
                        CoreError::validation(format!(
                            "trial plan '{}' duration of {minutes} minutes is out of range",
                            plan.code
                        ))
                    })?,
            ),
        };
        let credit_ms = minutes_to_ms(plan.voice_minutes)?;
        let sql = format!(
            r#"
            INSERT INTO subscriptions
                (bot_id, telegram_id, plan_id, status, started_at, expires_at, voice_balance_ms, payment_id, updated_at)
            VALUES (?1, ?2, ?3, 'trial', ?4, ?5, ?6, NULL, ?4)
            ON CONFLICT (bot_id, telegram_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                status = 'trial',
                started_at = excluded.started_at,
                expires_at = excluded.expires_at,
                voice_balance_ms = subscriptions.voice_balance_ms + excluded.voice_balance_ms,
                payment_id = NULL,
                updated_at = MAX(excluded.updated_at, subscriptions.updated_at + 1)
            WHERE subscriptions.status != 'active'
            RETURNING {COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .bind(plan.id)
            .bind(now)
            .bind(expires_at)
            .bind(credit_ms)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    /// Ids of pending records last touched before `cutoff`.
    #[instrument(skip(self))]
    pub async fn stale_pending(&self, cutoff: i64) -> CoreResult<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM subscriptions WHERE status = 'pending' AND updated_at < ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|row| row.0).collect())
    }

    /// Compare-and-set one record `pending -> expired`, only if it is still
    /// pending and still older than `cutoff`.
    #[instrument(skip(self))]
    pub async fn expire_pending_if_stale(&self, id: i64, cutoff: i64, now: i64) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = MAX(?3, updated_at + 1)
            WHERE id = ?1 AND status = 'pending' AND updated_at < ?2
            "#,
        )
        .bind(id)
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Expire every trial or active record whose period has passed.
    #[instrument(skip(self))]
    pub async fn expire_lapsed(&self, now: i64) -> CoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = MAX(?1, updated_at + 1)
            WHERE status IN ('active', 'trial') AND expires_at IS NOT NULL AND expires_at < ?1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Remove the record entirely.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &UserKey) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE bot_id = ? AND telegram_id = ?")
            .bind(&key.bot_id)
            .bind(key.telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Decide what a non-applying activation means from the record's state.
fn classify_activation(
    current: Option<SubscriptionRecord>,
    describe: impl FnOnce() -> String,
) -> CoreResult<Activation> {
    match current {
        Some(record) if record.status == SubscriptionStatus::Active => Ok(Activation::AlreadyActive),
        Some(record) => Err(CoreError::InvalidTransition {
            action: "activate",
            status: record.status.to_string(),
        }),
        None => Err(CoreError::not_found(describe())),
    }
}
