//! Payment provider seam and checkout flow.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

use super::models::PaymentLink;
use crate::catalog::CatalogRepository;
use crate::error::{CoreError, CoreResult};
use crate::key::UserKey;
use crate::subscription::{SubscriptionRecord, SubscriptionService, SubscriptionStatus};

/// Payment gateway client. Implementations own the wire protocol.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_subscription_payment(
        &self,
        key: &UserKey,
        plan_code: &str,
        price: f64,
    ) -> CoreResult<PaymentLink>;

    async fn create_minute_package_payment(
        &self,
        key: &UserKey,
        package_id: i64,
        price: f64,
        title: &str,
        minutes: i64,
    ) -> CoreResult<PaymentLink>;
}

/// Result of starting a subscription checkout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CheckoutOutcome {
    /// Free plan, active right away.
    Activated { subscription: SubscriptionRecord },
    /// The user has to pay at `link` before the record activates.
    AwaitingPayment {
        link: PaymentLink,
        subscription: SubscriptionRecord,
    },
}

/// Starts purchases: asks the provider for a payment and records what it
/// will pay for.
#[derive(Clone)]
pub struct Checkout {
    provider: Arc<dyn PaymentProvider>,
    subscriptions: SubscriptionService,
    catalog: CatalogRepository,
}

impl Checkout {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        subscriptions: SubscriptionService,
        catalog: CatalogRepository,
    ) -> Self {
        Self {
            provider,
            subscriptions,
            catalog,
        }
    }

    /// Subscribe to a plan. The provider is called before anything is
    /// written, and no storage transaction is open during that call.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn subscribe(&self, key: &UserKey, plan_code: &str) -> CoreResult<CheckoutOutcome> {
        let plan = self
            .catalog
            .get_plan_by_code(&key.bot_id, plan_code)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("plan '{plan_code}' for bot '{}'", key.bot_id))
            })?;

        let status = self.subscriptions.get_status(key).await?;
        if status == SubscriptionStatus::Active {
            return Err(CoreError::InvalidTransition {
                action: "create",
                status: status.to_string(),
            });
        }

        if plan.is_free() {
            let subscription = self.subscriptions.create(key, &plan.code, None).await?;
            return Ok(CheckoutOutcome::Activated { subscription });
        }

        let link = self
            .provider
            .create_subscription_payment(key, &plan.code, plan.price)
            .await?;
        let subscription = self
            .subscriptions
            .create(key, &plan.code, Some(&link.provider_payment_id))
            .await?;

        info!(%key, plan = %plan.code, payment_id = %link.provider_payment_id, "Subscription checkout started");
        Ok(CheckoutOutcome::AwaitingPayment { link, subscription })
    }

    /// Buy a minute package. Credit happens when the payment is confirmed.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn buy_minutes(&self, key: &UserKey, package_id: i64) -> CoreResult<PaymentLink> {
        let package = self
            .catalog
            .get_package(&key.bot_id, package_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "active minute package {package_id} for bot '{}'",
                    key.bot_id
                ))
            })?;

        if self.subscriptions.get(key).await?.is_none() {
            return Err(CoreError::not_found(format!("subscription {key}")));
        }

        let link = self
            .provider
            .create_minute_package_payment(key, package.id, package.price, &package.name, package.minutes)
            .await?;

        info!(%key, package_id, payment_id = %link.provider_payment_id, "Minute package checkout started");
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NewMinutePackage, NewTariffPlan};
    use crate::db::Database;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl PaymentProvider for RecordingProvider {
        async fn create_subscription_payment(
            &self,
            key: &UserKey,
            plan_code: &str,
            _price: f64,
        ) -> CoreResult<PaymentLink> {
            if self.fail {
                return Err(CoreError::provider("gateway unavailable"));
            }
            let id = format!("sub-{}-{plan_code}", key.telegram_id);
            self.calls.lock().unwrap().push(id.clone());
            Ok(PaymentLink {
                redirect_url: format!("https://pay.example/{id}"),
                provider_payment_id: id,
            })
        }

        async fn create_minute_package_payment(
            &self,
            key: &UserKey,
            package_id: i64,
            _price: f64,
            _title: &str,
            _minutes: i64,
        ) -> CoreResult<PaymentLink> {
            let id = format!("pkg-{}-{package_id}", key.telegram_id);
            self.calls.lock().unwrap().push(id.clone());
            Ok(PaymentLink {
                redirect_url: format!("https://pay.example/{id}"),
                provider_payment_id: id,
            })
        }
    }

    async fn setup(provider: Arc<RecordingProvider>) -> (Database, Checkout, i64) {
        let db = Database::in_memory().await.unwrap();
        let catalog = CatalogRepository::new(db.pool().clone());
        for (code, price) in [("monthly", 499.0), ("free", 0.0)] {
            catalog
                .create_plan(NewTariffPlan {
                    bot_id: "math".to_string(),
                    code: code.to_string(),
                    name: code.to_string(),
                    price,
                    duration_minutes: 0,
                    voice_minutes: 0.0,
                    is_trial: false,
                    description: String::new(),
                })
                .await
                .unwrap();
        }
        let package = catalog
            .create_package(NewMinutePackage {
                bot_id: "math".to_string(),
                name: "Fifty".to_string(),
                minutes: 50,
                price: 490.0,
                active: true,
            })
            .await
            .unwrap();
        let checkout = Checkout::new(
            provider,
            SubscriptionService::new(db.pool().clone()),
            catalog,
        );
        (db, checkout, package.id)
    }

    #[tokio::test]
    async fn test_paid_plan_records_payment_id() {
        let provider = Arc::new(RecordingProvider::default());
        let (_db, checkout, _) = setup(Arc::clone(&provider)).await;
        let key = UserKey::new("math", 9).unwrap();

        let CheckoutOutcome::AwaitingPayment { link, subscription } =
            checkout.subscribe(&key, "monthly").await.unwrap()
        else {
            panic!("expected a payment link");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Pending);
        assert_eq!(subscription.payment_id, Some(link.provider_payment_id.clone()));
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_free_plan_skips_provider() {
        let provider = Arc::new(RecordingProvider::default());
        let (_db, checkout, _) = setup(Arc::clone(&provider)).await;
        let key = UserKey::new("math", 9).unwrap();

        let outcome = checkout.subscribe(&key, "free").await.unwrap();
        assert!(matches!(
            outcome,
            CheckoutOutcome::Activated { ref subscription } if subscription.status == SubscriptionStatus::Active
        ));
        assert!(provider.calls.lock().unwrap().is_empty());

        // Already active: no new payment is created.
        assert!(matches!(
            checkout.subscribe(&key, "monthly").await,
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_writes_nothing() {
        let provider = Arc::new(RecordingProvider {
            fail: true,
            ..Default::default()
        });
        let (db, checkout, _) = setup(provider).await;
        let key = UserKey::new("math", 9).unwrap();

        let err = checkout.subscribe(&key, "monthly").await.unwrap_err();
        assert!(err.is_transient());
        let service = SubscriptionService::new(db.pool().clone());
        assert_eq!(service.get_status(&key).await.unwrap(), SubscriptionStatus::None);
    }

    #[tokio::test]
    async fn test_buy_minutes_requires_record() {
        let provider = Arc::new(RecordingProvider::default());
        let (_db, checkout, package_id) = setup(Arc::clone(&provider)).await;
        let key = UserKey::new("math", 9).unwrap();

        assert!(matches!(
            checkout.buy_minutes(&key, package_id).await,
            Err(CoreError::NotFound(_))
        ));

        checkout.subscribe(&key, "free").await.unwrap();
        let link = checkout.buy_minutes(&key, package_id).await.unwrap();
        assert_eq!(link.provider_payment_id, format!("pkg-9-{package_id}"));
    }
}
