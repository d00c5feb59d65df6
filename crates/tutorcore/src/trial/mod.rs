//! One-time trial grants.
//!
//! A row in `trial_usages` is the only record that a user consumed the
//! trial of a bot. Claiming is a single insert-if-absent, so concurrent
//! claims for the same key produce exactly one winner.

mod repository;

pub use repository::TrialGate;
