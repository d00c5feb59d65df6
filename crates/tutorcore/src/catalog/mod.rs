//! Tariff plan and minute package catalog.

mod models;
mod repository;

pub use models::{MinutePackage, NewMinutePackage, NewTariffPlan, TariffPlan};
pub use repository::{CatalogRepository, MAX_PLAN_DURATION_MINUTES};
