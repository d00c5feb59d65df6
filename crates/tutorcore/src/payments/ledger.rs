//! Ledger of applied payment confirmations.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::instrument;

use crate::error::CoreResult;
use crate::key::UserKey;

/// Set of provider payment ids that were already applied.
#[derive(Debug, Clone)]
pub struct PaymentLedger {
    pool: SqlitePool,
}

impl PaymentLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn is_processed(&self, provider_payment_id: &str) -> CoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM processed_payments WHERE provider_payment_id = ?")
                .bind(provider_payment_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Record the payment id. Returns `false` when it was already recorded.
    pub(crate) async fn mark_on(
        conn: &mut SqliteConnection,
        provider_payment_id: &str,
        key: &UserKey,
        payment_type: &str,
        now: i64,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_payments (provider_payment_id, bot_id, telegram_id, payment_type, processed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (provider_payment_id) DO NOTHING
            "#,
        )
        .bind(provider_payment_id)
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .bind(payment_type)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
