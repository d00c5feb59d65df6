//! Background sweep of stale pending and lapsed subscriptions.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use super::service::SubscriptionService;

/// Run the sweep on a fixed interval until `shutdown` flips to `true` or
/// its sender is dropped. Failures are logged and retried on the next tick.
pub async fn run_sweeper(
    service: SubscriptionService,
    interval: Duration,
    pending_ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = interval.as_secs(),
        pending_ttl_secs = pending_ttl.as_secs(),
        "Subscription sweeper started"
    );
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match service.sweep_once(pending_ttl).await {
                    Ok(report) => debug!(?report, "Sweep finished"),
                    Err(err) => warn!("subscription sweep failed: {}", err),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Subscription sweeper stopped");
}
