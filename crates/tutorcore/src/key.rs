//! Tenant-scoped user identity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, CoreResult};

/// A user as seen by one bot. Every shared resource in the core is keyed by
/// this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserKey {
    pub bot_id: String,
    pub telegram_id: i64,
}

impl UserKey {
    /// Build a validated key.
    pub fn new(bot_id: impl Into<String>, telegram_id: i64) -> CoreResult<Self> {
        let bot_id = bot_id.into().trim().to_string();
        if bot_id.is_empty() {
            return Err(CoreError::validation("bot_id must not be empty"));
        }
        if telegram_id == 0 {
            return Err(CoreError::validation("telegram_id must be non-zero"));
        }
        Ok(Self {
            bot_id,
            telegram_id,
        })
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bot_id, self.telegram_id)
    }
}

/// Balances are stored as whole milliseconds of voice time.
pub const MS_PER_MINUTE: i64 = 60_000;

/// Largest single minute amount accepted for a credit, debit or plan.
pub const MAX_MINUTES: f64 = 1_000_000_000.0;

/// Validate a voice-minute quantity.
pub(crate) fn check_minutes(amount: f64) -> CoreResult<f64> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(CoreError::validation(format!(
            "minute amount must be a finite non-negative number, got {amount}"
        )));
    }
    if amount > MAX_MINUTES {
        return Err(CoreError::validation(format!(
            "minute amount must not exceed {MAX_MINUTES}, got {amount}"
        )));
    }
    Ok(amount)
}

/// Validate `amount` minutes and convert to stored milliseconds.
pub(crate) fn minutes_to_ms(amount: f64) -> CoreResult<i64> {
    let amount = check_minutes(amount)?;
    Ok((amount * MS_PER_MINUTE as f64).round() as i64)
}

pub(crate) fn ms_to_minutes(ms: i64) -> f64 {
    ms as f64 / MS_PER_MINUTE as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_trims_and_validates() {
        let key = UserKey::new("  math-bot ", 42).unwrap();
        assert_eq!(key.bot_id, "math-bot");
        assert_eq!(key.to_string(), "math-bot/42");

        assert!(matches!(
            UserKey::new("   ", 42),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            UserKey::new("math-bot", 0),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_check_minutes() {
        assert_eq!(check_minutes(0.0).unwrap(), 0.0);
        assert_eq!(check_minutes(1.5).unwrap(), 1.5);
        assert!(check_minutes(-0.1).is_err());
        assert!(check_minutes(f64::NAN).is_err());
        assert!(check_minutes(f64::INFINITY).is_err());
        assert!(check_minutes(MAX_MINUTES * 2.0).is_err());
    }

    #[test]
    fn test_minute_conversion_is_exact_for_whole_seconds() {
        assert_eq!(minutes_to_ms(0.1).unwrap(), 6_000);
        assert_eq!(minutes_to_ms(10.0 / 60.0).unwrap(), 10_000);
        assert_eq!(ms_to_minutes(18_000), 0.3);
        assert_eq!(ms_to_minutes(minutes_to_ms(2.5).unwrap()), 2.5);
    }
}
