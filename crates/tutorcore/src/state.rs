//! Shared state wiring every component over one database.

use std::sync::Arc;

use crate::account::AccountService;
use crate::bots::BotDirectory;
use crate::catalog::CatalogRepository;
use crate::config::BillingConfig;
use crate::db::Database;
use crate::history::HistoryWindow;
use crate::meter::UsageMeter;
use crate::payments::{PaymentLedger, PaymentReconciler};
use crate::subscription::SubscriptionService;
use crate::trial::TrialGate;

/// Shared handles to the subscription, metering and history core.
#[derive(Debug, Clone)]
pub struct TutorCore {
    pub catalog: CatalogRepository,
    pub subscriptions: SubscriptionService,
    pub meter: UsageMeter,
    pub trials: TrialGate,
    pub history: HistoryWindow,
    pub ledger: PaymentLedger,
    pub reconciler: PaymentReconciler,
    pub accounts: AccountService,
    pub bots: Arc<BotDirectory>,
    pub billing: BillingConfig,
}

impl TutorCore {
    pub fn new(db: &Database, billing: BillingConfig, bots: Arc<BotDirectory>) -> Self {
        let pool = db.pool().clone();
        let subscriptions = SubscriptionService::new(pool.clone());
        let trials = TrialGate::new(pool.clone());
        let history = HistoryWindow::with_max_chars(pool.clone(), billing.history_max_chars);

        Self {
            catalog: CatalogRepository::new(pool.clone()),
            meter: UsageMeter::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            reconciler: PaymentReconciler::new(pool, Arc::clone(&bots)),
            accounts: AccountService::new(subscriptions.clone(), trials.clone(), history.clone()),
            subscriptions,
            trials,
            history,
            bots,
            billing,
        }
    }
}
