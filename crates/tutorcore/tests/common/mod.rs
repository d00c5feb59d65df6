//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use tutorcore::TutorCore;
use tutorcore::UserKey;
use tutorcore::bots::{BotDirectory, BotRegistry};
use tutorcore::catalog::{MinutePackage, NewMinutePackage, NewTariffPlan};
use tutorcore::config::{BillingConfig, BotEntry};
use tutorcore::db::Database;

pub const BOT: &str = "math";

/// Catalog ids seeded by [`seed_catalog`].
pub struct Seeded {
    pub package: MinutePackage,
    pub retired_package: MinutePackage,
}

fn directory() -> Arc<BotDirectory> {
    let registry = BotRegistry::from_entries(&[
        BotEntry {
            id: BOT.to_string(),
            name: "Math Tutor".to_string(),
        },
        BotEntry {
            id: "english".to_string(),
            name: "English Tutor".to_string(),
        },
    ])
    .unwrap();
    Arc::new(BotDirectory::new(registry))
}

/// Core over an in-memory database.
pub async fn memory_core() -> (Database, TutorCore, Seeded) {
    let db = Database::in_memory().await.unwrap();
    let core = TutorCore::new(&db, BillingConfig::default(), directory());
    let seeded = seed_catalog(&core).await;
    (db, core, seeded)
}

/// Core over a file database with a multi-connection pool, so concurrent
/// tasks really race inside SQLite.
pub async fn file_core() -> (TempDir, Database, TutorCore, Seeded) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(&dir.path().join("tutorcore.db")).await.unwrap();
    let core = TutorCore::new(&db, BillingConfig::default(), directory());
    let seeded = seed_catalog(&core).await;
    (dir, db, core, seeded)
}

pub async fn seed_catalog(core: &TutorCore) -> Seeded {
    for (code, price, duration_minutes, voice_minutes, is_trial) in [
        ("monthly", 499.0, 60 * 24 * 30, 60.0, false),
        ("free", 0.0, 0, 0.0, false),
        ("trial", 0.0, 60 * 24 * 3, 15.0, true),
    ] {
        core.catalog
            .create_plan(NewTariffPlan {
                bot_id: BOT.to_string(),
                code: code.to_string(),
                name: code.to_string(),
                price,
                duration_minutes,
                voice_minutes,
                is_trial,
                description: String::new(),
            })
            .await
            .unwrap();
    }

    let package = core
        .catalog
        .create_package(NewMinutePackage {
            bot_id: BOT.to_string(),
            name: "Hundred minutes".to_string(),
            minutes: 100,
            price: 990.0,
            active: true,
        })
        .await
        .unwrap();
    let retired_package = core
        .catalog
        .create_package(NewMinutePackage {
            bot_id: BOT.to_string(),
            name: "Old bundle".to_string(),
            minutes: 30,
            price: 290.0,
            active: false,
        })
        .await
        .unwrap();

    Seeded {
        package,
        retired_package,
    }
}

pub fn key(telegram_id: i64) -> UserKey {
    UserKey::new(BOT, telegram_id).unwrap()
}

/// Move a record's `updated_at` into the past.
pub async fn age_record(db: &Database, key: &UserKey, by_ms: i64) {
    sqlx::query("UPDATE subscriptions SET updated_at = updated_at - ? WHERE bot_id = ? AND telegram_id = ?")
        .bind(by_ms)
        .bind(&key.bot_id)
        .bind(key.telegram_id)
        .execute(db.pool())
        .await
        .unwrap();
}
