//! End-to-end lifecycle tests across components.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{BOT, age_record, key, memory_core};
use tutorcore::CoreError;
use tutorcore::account::ResetOptions;
use tutorcore::history::{HistoryEntry, Role};
use tutorcore::payments::{PaymentEvent, Reconciliation};
use tutorcore::subscription::{Activation, SubscriptionStatus, TrialOutcome};

fn package_event(payment_id: &str, telegram_id: i64, package_id: i64) -> PaymentEvent {
    PaymentEvent {
        provider_payment_id: payment_id.to_string(),
        metadata: HashMap::from([
            ("bot_id".to_string(), BOT.to_string()),
            ("telegram_id".to_string(), telegram_id.to_string()),
            ("payment_type".to_string(), "minute_package".to_string()),
            ("package_id".to_string(), package_id.to_string()),
        ]),
    }
}

#[tokio::test]
async fn test_create_activate_delete_status() {
    let (_db, core, _) = memory_core().await;
    let k = key(1);

    core.subscriptions.create(&k, "monthly", None).await.unwrap();
    assert_eq!(
        core.subscriptions.get_status(&k).await.unwrap(),
        SubscriptionStatus::Pending
    );

    core.subscriptions.activate(&k).await.unwrap();
    assert_eq!(
        core.subscriptions.get_status(&k).await.unwrap(),
        SubscriptionStatus::Active
    );

    core.subscriptions.delete(&k).await.unwrap();
    assert_eq!(
        core.subscriptions.get_status(&k).await.unwrap(),
        SubscriptionStatus::None
    );
}

#[tokio::test]
async fn test_package_credit_and_usage() {
    let (_db, core, seeded) = memory_core().await;
    let k = key(2);
    core.subscriptions.create(&k, "free", None).await.unwrap();

    let outcome = core
        .reconciler
        .on_payment_confirmed(&package_event("pay-100", 2, seeded.package.id))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Reconciliation::Credited {
            minutes: 100,
            balance: 100.0
        }
    );

    assert!(core.meter.use_voice_minutes(&k, 40.0).await.unwrap());
    assert_eq!(core.meter.balance(&k).await.unwrap(), Some(60.0));

    assert!(!core.meter.use_voice_minutes(&k, 70.0).await.unwrap());
    assert_eq!(core.meter.balance(&k).await.unwrap(), Some(60.0));
}

#[tokio::test]
async fn test_redelivered_payment_applies_once() {
    let (_db, core, seeded) = memory_core().await;
    let k = key(3);
    core.subscriptions.create(&k, "free", None).await.unwrap();

    let event = package_event("pay-200", 3, seeded.package.id);
    for _ in 0..3 {
        core.reconciler.on_payment_confirmed(&event).await.unwrap();
    }
    assert_eq!(core.meter.balance(&k).await.unwrap(), Some(100.0));
    assert!(core.ledger.is_processed("pay-200").await.unwrap());
}

#[tokio::test]
async fn test_retired_package_then_reenabled() {
    let (_db, core, seeded) = memory_core().await;
    let k = key(4);
    core.subscriptions.create(&k, "free", None).await.unwrap();

    let event = package_event("pay-300", 4, seeded.retired_package.id);
    let err = core.reconciler.on_payment_confirmed(&event).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert!(!core.ledger.is_processed("pay-300").await.unwrap());

    core.catalog
        .set_package_active(BOT, seeded.retired_package.id, true)
        .await
        .unwrap();
    assert_eq!(
        core.reconciler.on_payment_confirmed(&event).await.unwrap(),
        Reconciliation::Credited {
            minutes: 30,
            balance: 30.0
        }
    );
    assert_eq!(
        core.reconciler.on_payment_confirmed(&event).await.unwrap(),
        Reconciliation::Duplicate
    );
}

#[tokio::test]
async fn test_late_payment_after_sweep_still_activates() {
    let (db, core, _) = memory_core().await;
    let k = key(5);
    core.subscriptions
        .create(&k, "monthly", Some("pay-400"))
        .await
        .unwrap();
    age_record(&db, &k, 10 * 60 * 1000).await;

    let report = core
        .subscriptions
        .sweep_once(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(report.expired_pending, 1);
    assert_eq!(
        core.subscriptions.get_status(&k).await.unwrap(),
        SubscriptionStatus::Expired
    );

    assert_eq!(
        core.subscriptions.activate_by_payment("pay-400").await.unwrap(),
        Activation::Activated
    );
    let record = core.subscriptions.get(&k).await.unwrap().unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.voice_minutes_balance, 60.0);
}

#[tokio::test]
async fn test_cleanup_skips_record_activated_first() {
    let (db, core, _) = memory_core().await;
    let k = key(6);
    core.subscriptions.create(&k, "monthly", None).await.unwrap();
    age_record(&db, &k, 10 * 60 * 1000).await;

    core.subscriptions.activate(&k).await.unwrap();
    assert_eq!(
        core.subscriptions
            .cleanup_pending(Duration::from_secs(300))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        core.subscriptions.get_status(&k).await.unwrap(),
        SubscriptionStatus::Active
    );
}

#[tokio::test]
async fn test_trial_then_reset_keeps_grant() {
    let (_db, core, _) = memory_core().await;
    let k = key(7);

    assert!(matches!(
        core.subscriptions.start_trial(&k).await.unwrap(),
        TrialOutcome::Granted(_)
    ));
    assert!(core.meter.use_voice_minutes(&k, 15.0).await.unwrap());

    core.accounts
        .reset_settings(&k, ResetOptions::default())
        .await
        .unwrap();
    assert_eq!(
        core.subscriptions.start_trial(&k).await.unwrap(),
        TrialOutcome::AlreadyClaimed
    );
    assert!(core.trials.has_claimed(&k).await.unwrap());
}

#[tokio::test]
async fn test_trial_without_plan_leaves_no_grant() {
    let (_db, core, _) = memory_core().await;
    let k = tutorcore::UserKey::new("english", 8).unwrap();

    assert!(matches!(
        core.subscriptions.start_trial(&k).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(!core.trials.has_claimed(&k).await.unwrap());
}

#[tokio::test]
async fn test_history_windows() {
    let (_db, core, _) = memory_core().await;
    let k = key(9);

    for text in ["A", "B", "C", "D", "E"] {
        core.history.append_text(&k, Role::User, text).await.unwrap();
    }
    let last: Vec<String> = core
        .history
        .get_last_n(&k, 3)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| e.text_content)
        .collect();
    assert_eq!(last, vec!["C", "D", "E"]);

    // Everything fits in the default budget.
    let bounded = core.history.get_bounded(&k, None).await.unwrap();
    assert_eq!(bounded, core.history.get_full(&k).await.unwrap());

    // Tight budget keeps a contiguous suffix in order.
    core.history.append_image(&k, Role::Tutor, "media/plot.png").await.unwrap();
    core.history.append_text(&k, Role::Tutor, "FG").await.unwrap();
    let window = core.history.get_bounded(&k, Some(3)).await.unwrap();
    let lengths: Vec<usize> = window.iter().map(HistoryEntry::budget_len).collect();
    assert_eq!(lengths, vec![1, 0, 2]);
    assert_eq!(window[0].text_content.as_deref(), Some("E"));
}
