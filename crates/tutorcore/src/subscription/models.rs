//! Subscription data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::format_ms;

/// Access tier of a (bot, user) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// No record exists. Never stored.
    None,
    /// Plan selected, payment not yet confirmed.
    Pending,
    /// Time-boxed free access.
    Trial,
    /// Paid and current.
    Active,
    /// Period lapsed or pending payment never arrived.
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Whether the tier lets the user talk to the bot.
    pub fn has_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(SubscriptionStatus::None),
            "pending" => Ok(SubscriptionStatus::Pending),
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            _ => Err(format!("unknown subscription status: {}", s)),
        }
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Stored access record for one (bot, user) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub bot_id: String,
    pub telegram_id: i64,
    pub plan_id: Option<i64>,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    /// Unix milliseconds.
    pub started_at: i64,
    /// Unix milliseconds. `None` for open-ended access.
    pub expires_at: Option<i64>,
    pub voice_minutes_balance: f64,
    /// Provider payment id of the checkout that created the record.
    pub payment_id: Option<String>,
    /// Unix milliseconds, strictly increasing per record.
    pub updated_at: i64,
}

impl SubscriptionRecord {
    /// One-line human summary used by the operator CLI.
    pub fn summary(&self) -> String {
        let expires = self
            .expires_at
            .map(format_ms)
            .unwrap_or_else(|| "never".to_string());
        format!(
            "{}/{} {} balance={:.2} expires={} updated={}",
            self.bot_id,
            self.telegram_id,
            self.status,
            self.voice_minutes_balance,
            expires,
            format_ms(self.updated_at)
        )
    }
}

/// Result of an activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// This call moved the record to `active`.
    Activated,
    /// The record was already active; nothing changed.
    AlreadyActive,
}

/// Result of a trial request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "subscription")]
pub enum TrialOutcome {
    Granted(SubscriptionRecord),
    AlreadyClaimed,
}

/// Counts from one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_pending: u64,
    pub lapsed: u64,
}
