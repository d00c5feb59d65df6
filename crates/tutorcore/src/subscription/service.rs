//! Subscription state machine.

use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use super::models::{Activation, SubscriptionRecord, SubscriptionStatus, SweepReport, TrialOutcome};
use super::repository::SubscriptionRepository;
use crate::catalog::CatalogRepository;
use crate::db::{duration_ms, now_ms};
use crate::error::{CoreError, CoreResult};
use crate::key::UserKey;
use crate::trial::TrialGate;

/// Service driving subscription lifecycle transitions.
#[derive(Debug, Clone)]
pub struct SubscriptionService {
    repo: SubscriptionRepository,
    catalog: CatalogRepository,
}

impl SubscriptionService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            repo: SubscriptionRepository::new(pool.clone()),
            catalog: CatalogRepository::new(pool),
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.repo.pool()
    }

    /// Enter `pending` for a plan of the bot's catalog.
    ///
    /// Free plans are activated in the same transaction. An active record is
    /// never overwritten.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn create(
        &self,
        key: &UserKey,
        plan_code: &str,
        payment_id: Option<&str>,
    ) -> CoreResult<SubscriptionRecord> {
        let plan = self
            .catalog
            .get_plan_by_code(&key.bot_id, plan_code)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("plan '{plan_code}' for bot '{}'", key.bot_id))
            })?;

        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        let created = SubscriptionRepository::create_on(&mut tx, key, plan.id, payment_id, now).await?;
        if created.is_none() {
            let status = SubscriptionRepository::get_on(&mut tx, key)
                .await?
                .map(|r| r.status)
                .unwrap_or(SubscriptionStatus::None);
            return Err(CoreError::InvalidTransition {
                action: "create",
                status: status.to_string(),
            });
        }

        if plan.is_free() {
            SubscriptionRepository::activate_on(&mut tx, key, now).await?;
        }

        let record = SubscriptionRepository::get_on(&mut tx, key)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subscription {key}")))?;
        tx.commit().await?;

        info!(%key, plan = %plan.code, status = %record.status, "Subscription created");
        Ok(record)
    }

    /// Confirm payment for a key. Repeating the call is a no-op success.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn activate(&self, key: &UserKey) -> CoreResult<Activation> {
        let mut conn = self.pool().acquire().await?;
        let outcome = SubscriptionRepository::activate_on(&mut conn, key, now_ms()).await?;
        info!(%key, ?outcome, "Activation processed");
        Ok(outcome)
    }

    /// Confirm payment for the record created with a provider payment id.
    #[instrument(skip(self))]
    pub async fn activate_by_payment(&self, payment_id: &str) -> CoreResult<Activation> {
        if payment_id.trim().is_empty() {
            return Err(CoreError::validation("payment id must not be empty"));
        }
        let mut conn = self.pool().acquire().await?;
        let outcome =
            SubscriptionRepository::activate_by_payment_on(&mut conn, payment_id, now_ms()).await?;
        info!(payment_id, ?outcome, "Activation processed");
        Ok(outcome)
    }

    /// Current status; `None` when no record exists.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_status(&self, key: &UserKey) -> CoreResult<SubscriptionStatus> {
        Ok(self
            .repo
            .get(key)
            .await?
            .map(|r| r.status)
            .unwrap_or(SubscriptionStatus::None))
    }

    pub async fn get(&self, key: &UserKey) -> CoreResult<Option<SubscriptionRecord>> {
        self.repo.get(key).await
    }

    pub async fn list_all(&self) -> CoreResult<Vec<SubscriptionRecord>> {
        self.repo.list_all().await
    }

    /// Grant the bot's trial plan, once per key.
    ///
    /// The grant and the subscription change commit together. If the
    /// record cannot enter `trial`, the grant is rolled back too.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn start_trial(&self, key: &UserKey) -> CoreResult<TrialOutcome> {
        let plan = self
            .catalog
            .get_trial_plan(&key.bot_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("trial plan for bot '{}'", key.bot_id)))?;

        let now = now_ms();
        let mut tx = self.pool().begin().await?;

        if !TrialGate::claim_on(&mut tx, key, now).await? {
            debug!(%key, "Trial already claimed");
            return Ok(TrialOutcome::AlreadyClaimed);
        }

        let Some(record) = SubscriptionRepository::start_trial_on(&mut tx, key, &plan, now).await?
        else {
            let status = SubscriptionRepository::get_on(&mut tx, key)
                .await?
                .map(|r| r.status)
                .unwrap_or(SubscriptionStatus::None);
            return Err(CoreError::InvalidTransition {
                action: "start a trial on",
                status: status.to_string(),
            });
        };

        tx.commit().await?;
        info!(%key, plan = %plan.code, "Trial granted");
        Ok(TrialOutcome::Granted(record))
    }

    /// Expire pending records untouched for longer than `older_than`.
    ///
    /// Candidates are re-checked one by one at write time, so a record
    /// activated after it was read is left alone.
    #[instrument(skip(self))]
    pub async fn cleanup_pending(&self, older_than: Duration) -> CoreResult<u64> {
        let now = now_ms();
        let cutoff = now.saturating_sub(duration_ms(older_than));

        let mut expired = 0;
        for id in self.repo.stale_pending(cutoff).await? {
            if self.repo.expire_pending_if_stale(id, cutoff, now).await? {
                expired += 1;
            } else {
                debug!(id, "Pending record changed before it could be expired");
            }
        }

        if expired > 0 {
            info!(expired, "Expired stale pending subscriptions");
        }
        Ok(expired)
    }

    /// Expire trial and active records whose period has passed.
    #[instrument(skip(self))]
    pub async fn expire_lapsed(&self) -> CoreResult<u64> {
        let lapsed = self.repo.expire_lapsed(now_ms()).await?;
        if lapsed > 0 {
            info!(lapsed, "Expired lapsed subscriptions");
        }
        Ok(lapsed)
    }

    /// One sweeper pass. A failing step is logged and does not stop the other.
    pub async fn sweep_once(&self, pending_ttl: Duration) -> CoreResult<SweepReport> {
        let expired_pending = self.cleanup_pending(pending_ttl).await;
        let lapsed = self.expire_lapsed().await;

        match (expired_pending, lapsed) {
            (Ok(expired_pending), Ok(lapsed)) => Ok(SweepReport {
                expired_pending,
                lapsed,
            }),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(first), Err(second)) => {
                warn!("Lapsed expiry failed too: {}", second);
                Err(first)
            }
        }
    }

    /// Administrative hard reset of the record.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &UserKey) -> CoreResult<bool> {
        let deleted = self.repo.delete(key).await?;
        if deleted {
            info!(%key, "Subscription deleted");
        }
        Ok(deleted)
    }
}
