//! Immutable bot registry and its single owner.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::BotEntry;
use crate::error::{CoreError, CoreResult};

/// A bot tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotProfile {
    pub id: String,
    pub name: String,
}

/// Read-only map of bot id to profile. Built once, then shared by `Arc`.
#[derive(Debug, Clone, Default)]
pub struct BotRegistry {
    bots: HashMap<String, BotProfile>,
}

impl BotRegistry {
    /// Build from configuration. Ids are trimmed and must be unique.
    pub fn from_entries(entries: &[BotEntry]) -> CoreResult<Self> {
        let mut bots = HashMap::with_capacity(entries.len());
        for entry in entries {
            let profile = profile_from(entry)?;
            if bots.contains_key(&profile.id) {
                return Err(CoreError::validation(format!(
                    "bot '{}' is configured twice",
                    profile.id
                )));
            }
            bots.insert(profile.id.clone(), profile);
        }
        Ok(Self { bots })
    }

    pub fn get(&self, bot_id: &str) -> Option<&BotProfile> {
        self.bots.get(bot_id)
    }

    pub fn contains(&self, bot_id: &str) -> bool {
        self.bots.contains_key(bot_id)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    /// Profiles sorted by id.
    pub fn profiles(&self) -> Vec<&BotProfile> {
        let mut profiles: Vec<&BotProfile> = self.bots.values().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }
}

fn profile_from(entry: &BotEntry) -> CoreResult<BotProfile> {
    let id = entry.id.trim();
    if id.is_empty() {
        return Err(CoreError::validation("bot id must not be empty"));
    }
    let name = if entry.name.trim().is_empty() {
        id.to_string()
    } else {
        entry.name.trim().to_string()
    };
    Ok(BotProfile {
        id: id.to_string(),
        name,
    })
}

/// Owner of the current registry.
///
/// Readers take a snapshot and keep using it; changes publish a new
/// registry and never touch one that was handed out.
#[derive(Debug, Default)]
pub struct BotDirectory {
    current: RwLock<Arc<BotRegistry>>,
}

impl BotDirectory {
    pub fn new(registry: BotRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub async fn snapshot(&self) -> Arc<BotRegistry> {
        Arc::clone(&*self.current.read().await)
    }

    /// Add or replace a bot.
    pub async fn insert(&self, entry: &BotEntry) -> CoreResult<()> {
        let profile = profile_from(entry)?;
        let mut current = self.current.write().await;
        let mut next = BotRegistry::clone(&current);
        info!(bot_id = %profile.id, "Registering bot");
        next.bots.insert(profile.id.clone(), profile);
        *current = Arc::new(next);
        Ok(())
    }

    /// Remove a bot. Returns whether it was registered.
    pub async fn remove(&self, bot_id: &str) -> bool {
        let mut current = self.current.write().await;
        if !current.contains(bot_id) {
            return false;
        }
        let mut next = BotRegistry::clone(&current);
        next.bots.remove(bot_id);
        *current = Arc::new(next);
        info!(bot_id, "Unregistered bot");
        true
    }
}
