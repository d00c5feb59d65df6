//! Administrative "reset settings" for one user of one bot.

use serde::Serialize;
use tracing::{info, instrument};

use crate::error::CoreResult;
use crate::history::HistoryWindow;
use crate::key::UserKey;
use crate::subscription::SubscriptionService;
use crate::trial::TrialGate;

/// What a reset removes besides the subscription record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Also forget that the trial was consumed.
    pub with_trial: bool,
    /// Also delete the conversation history.
    pub with_history: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub subscription_deleted: bool,
    pub trial_revoked: bool,
    pub history_deleted: u64,
}

/// Resets a user back to the `none` state.
#[derive(Debug, Clone)]
pub struct AccountService {
    subscriptions: SubscriptionService,
    trials: TrialGate,
    history: HistoryWindow,
}

impl AccountService {
    pub fn new(subscriptions: SubscriptionService, trials: TrialGate, history: HistoryWindow) -> Self {
        Self {
            subscriptions,
            trials,
            history,
        }
    }

    /// Delete the subscription record. The trial grant stays unless
    /// `with_trial` is set.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn reset_settings(&self, key: &UserKey, options: ResetOptions) -> CoreResult<ResetReport> {
        let mut report = ResetReport {
            subscription_deleted: self.subscriptions.delete(key).await?,
            ..Default::default()
        };
        if options.with_trial {
            report.trial_revoked = self.trials.revoke(key).await?;
        }
        if options.with_history {
            report.history_deleted = self.history.clear_user(key).await?;
        }
        info!(%key, ?report, "User settings reset");
        Ok(report)
    }
}
