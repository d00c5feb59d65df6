//! Configuration sections shared by the library and the operator binary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_MAX_CHARS;

/// Timing and budget knobs of the subscription core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Age after which an unpaid `pending` record is swept.
    pub pending_ttl_secs: u64,
    /// How often the sweeper runs.
    pub sweep_interval_secs: u64,
    /// Character budget of a bounded history window.
    pub history_max_chars: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 300,
            sweep_interval_secs: 300,
            history_max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl BillingConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    /// Sweep interval, never shorter than one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// One configured bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BillingConfig::default();
        assert_eq!(cfg.pending_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(300));
        assert_eq!(cfg.history_max_chars, 60_000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: BillingConfig = toml::from_str("pending_ttl_secs = 60\nsweep_interval_secs = 0").unwrap();
        assert_eq!(cfg.pending_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
        assert_eq!(cfg.history_max_chars, 60_000);
    }
}
