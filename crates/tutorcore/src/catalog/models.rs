//! Catalog models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A subscription plan offered by one bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TariffPlan {
    pub id: i64,
    pub bot_id: String,
    /// Stable code users pick the plan by (e.g. "monthly").
    pub code: String,
    pub name: String,
    /// Price in the bot's currency. Zero marks a free plan.
    pub price: f64,
    /// Length of one paid period. Zero means open-ended.
    pub duration_minutes: i64,
    /// Voice minutes credited when the plan is activated.
    pub voice_minutes: f64,
    /// Whether this is the bot's one-time trial plan.
    pub is_trial: bool,
    pub description: String,
}

impl TariffPlan {
    pub fn is_free(&self) -> bool {
        self.price <= 0.0
    }
}

/// Request to add a tariff plan.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTariffPlan {
    pub bot_id: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub duration_minutes: i64,
    #[serde(default)]
    pub voice_minutes: f64,
    #[serde(default)]
    pub is_trial: bool,
    #[serde(default)]
    pub description: String,
}

/// A purchasable bundle of voice minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MinutePackage {
    pub id: i64,
    pub bot_id: String,
    pub name: String,
    pub minutes: i64,
    pub price: f64,
    pub active: bool,
}

/// Request to add a minute package.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMinutePackage {
    pub bot_id: String,
    pub name: String,
    pub minutes: i64,
    pub price: f64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}
