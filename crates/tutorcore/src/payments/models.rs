//! Payment data models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::key::UserKey;
use crate::subscription::Activation;

/// A confirmed payment as delivered by the provider webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub provider_payment_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What a payment pays for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "payment_type")]
pub enum PaymentKind {
    Subscription { plan_code: Option<String> },
    MinutePackage { package_id: i64 },
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Subscription { .. } => "subscription",
            PaymentKind::MinutePackage { .. } => "minute_package",
        }
    }
}

/// Parsed metadata of a payment event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub key: UserKey,
    pub kind: PaymentKind,
}

impl PaymentEvent {
    /// Extract the paying user and the purchase from the metadata.
    pub fn intent(&self) -> CoreResult<PaymentIntent> {
        let bot_id = self.required("bot_id")?;
        let telegram_id = self.required("telegram_id")?;
        let telegram_id: i64 = telegram_id.parse().map_err(|_| {
            CoreError::validation(format!("metadata telegram_id '{telegram_id}' is not an integer"))
        })?;
        let key = UserKey::new(bot_id, telegram_id)?;

        let kind = match self.required("payment_type")? {
            "subscription" => PaymentKind::Subscription {
                plan_code: self.optional("plan_code").map(str::to_string),
            },
            "minute_package" => {
                let raw = self.required("package_id")?;
                let package_id = raw.parse().map_err(|_| {
                    CoreError::validation(format!("metadata package_id '{raw}' is not an integer"))
                })?;
                PaymentKind::MinutePackage { package_id }
            }
            other => {
                return Err(CoreError::validation(format!(
                    "unknown payment_type '{other}'"
                )));
            }
        };

        Ok(PaymentIntent { key, kind })
    }

    fn optional(&self, field: &str) -> Option<&str> {
        self.metadata
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, field: &str) -> CoreResult<&str> {
        self.optional(field)
            .ok_or_else(|| CoreError::validation(format!("payment metadata is missing '{field}'")))
    }
}

/// Outcome of reconciling one payment event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Reconciliation {
    /// A subscription payment was applied.
    Activated { activation: Activation },
    /// A minute package was credited.
    Credited { minutes: i64, balance: f64 },
    /// The payment id was processed before; nothing changed.
    Duplicate,
}

/// Checkout link returned by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLink {
    pub redirect_url: String,
    pub provider_payment_id: String,
}
