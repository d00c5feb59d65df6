//! Applies confirmed payments exactly once.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::ledger::PaymentLedger;
use super::models::{PaymentEvent, PaymentKind, Reconciliation};
use crate::bots::BotDirectory;
use crate::catalog::CatalogRepository;
use crate::db::now_ms;
use crate::error::{CoreError, CoreResult};
use crate::meter::UsageMeter;
use crate::subscription::SubscriptionRepository;

/// Consumer of payment webhooks.
///
/// The processed-payment marker and the credit or activation it guards
/// commit in one transaction, so a redelivered event is absorbed and a
/// failed one leaves nothing behind to block the retry.
#[derive(Debug, Clone)]
pub struct PaymentReconciler {
    pool: SqlitePool,
    catalog: CatalogRepository,
    ledger: PaymentLedger,
    bots: Arc<BotDirectory>,
}

impl PaymentReconciler {
    pub fn new(pool: SqlitePool, bots: Arc<BotDirectory>) -> Self {
        Self {
            catalog: CatalogRepository::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            pool,
            bots,
        }
    }

    pub async fn is_processed(&self, provider_payment_id: &str) -> CoreResult<bool> {
        self.ledger.is_processed(provider_payment_id).await
    }

    #[instrument(skip(self, event), fields(payment_id = %event.provider_payment_id))]
    pub async fn on_payment_confirmed(&self, event: &PaymentEvent) -> CoreResult<Reconciliation> {
        let payment_id = event.provider_payment_id.trim();
        if payment_id.is_empty() {
            return Err(CoreError::validation("provider payment id must not be empty"));
        }

        let intent = event.intent()?;
        let key = intent.key;
        if !self.bots.snapshot().await.contains(&key.bot_id) {
            return Err(CoreError::validation(format!("unknown bot '{}'", key.bot_id)));
        }

        let package = match &intent.kind {
            PaymentKind::MinutePackage { package_id } => {
                let package = self
                    .catalog
                    .get_package(&key.bot_id, *package_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::not_found(format!(
                            "minute package {package_id} for bot '{}'",
                            key.bot_id
                        ))
                    })?;
                if !package.active {
                    return Err(CoreError::validation(format!(
                        "minute package {package_id} is not active"
                    )));
                }
                Some(package)
            }
            PaymentKind::Subscription { .. } => None,
        };

        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        if !PaymentLedger::mark_on(&mut tx, payment_id, &key, intent.kind.as_str(), now).await? {
            info!(%key, "Duplicate payment event ignored");
            return Ok(Reconciliation::Duplicate);
        }

        let outcome = match package {
            Some(package) => {
                let balance = UsageMeter::add_minutes_on(&mut tx, &key, package.minutes as f64, now)
                    .await?
                    .ok_or_else(|| CoreError::not_found(format!("subscription {key}")))?;
                Reconciliation::Credited {
                    minutes: package.minutes,
                    balance,
                }
            }
            None => {
                let activation =
                    SubscriptionRepository::activate_for_payment_on(&mut tx, &key, payment_id, now)
                        .await?;
                if let PaymentKind::Subscription {
                    plan_code: Some(plan_code),
                } = &intent.kind
                {
                    info!(%key, plan_code, "Subscription payment applied");
                }
                Reconciliation::Activated { activation }
            }
        };

        tx.commit().await?;
        info!(%key, ?outcome, "Payment reconciled");
        Ok(outcome)
    }
}
