//! Subscription lifecycle.
//!
//! States run `none -> pending -> active | trial -> expired`, and an
//! expired record re-enters `pending` when a new cycle starts.

mod models;
mod repository;
mod service;
mod sweeper;

pub use models::{Activation, SubscriptionRecord, SubscriptionStatus, SweepReport, TrialOutcome};
pub use repository::SubscriptionRepository;
pub use service::SubscriptionService;
pub use sweeper::run_sweeper;
