//! Payment checkout and webhook reconciliation.

mod ledger;
mod models;
mod provider;
mod reconciler;

pub use ledger::PaymentLedger;
pub use models::{PaymentEvent, PaymentIntent, PaymentKind, PaymentLink, Reconciliation};
pub use provider::{Checkout, CheckoutOutcome, PaymentProvider};
pub use reconciler::PaymentReconciler;
