//! Tutorcore
//!
//! Subscription lifecycle, voice-minute metering, one-time trials,
//! conversation history windowing and payment reconciliation for a
//! multi-bot tutoring service.

pub mod account;
pub mod bots;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod key;
pub mod meter;
pub mod payments;
pub mod state;
pub mod subscription;
pub mod trial;

pub use error::{CoreError, CoreResult};
pub use key::UserKey;
pub use state::TutorCore;
