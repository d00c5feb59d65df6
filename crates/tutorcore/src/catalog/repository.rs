//! Catalog repository for tariff plans and minute packages.

use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{MinutePackage, NewMinutePackage, NewTariffPlan, TariffPlan};
use crate::error::{CoreError, CoreResult};
use crate::key::check_minutes;

const PLAN_COLUMNS: &str =
    "id, bot_id, code, name, price, duration_minutes, voice_minutes, is_trial, description";

const PACKAGE_COLUMNS: &str = "id, bot_id, name, minutes, price, active";

/// Longest plan period: 100 years of 366 days. Matches the table CHECK.
pub const MAX_PLAN_DURATION_MINUTES: i64 = 60 * 24 * 366 * 100;

/// Repository for the read-mostly plan and package catalog.
#[derive(Debug, Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    /// Create a new catalog repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add a tariff plan.
    #[instrument(skip(self, plan), fields(bot_id = %plan.bot_id, code = %plan.code))]
    pub async fn create_plan(&self, plan: NewTariffPlan) -> CoreResult<TariffPlan> {
        if plan.bot_id.trim().is_empty() || plan.code.trim().is_empty() {
            return Err(CoreError::validation("plan bot_id and code must not be empty"));
        }
        if plan.price < 0.0 || plan.duration_minutes < 0 || plan.voice_minutes < 0.0 {
            return Err(CoreError::validation(
                "plan price, duration and voice minutes must not be negative",
            ));
        }
        if plan.duration_minutes > MAX_PLAN_DURATION_MINUTES {
            return Err(CoreError::validation(format!(
                "plan duration must not exceed {MAX_PLAN_DURATION_MINUTES} minutes"
            )));
        }
        check_minutes(plan.voice_minutes)?;

        let sql = format!(
            r#"
            INSERT INTO tariff_plans (bot_id, code, name, price, duration_minutes, voice_minutes, is_trial, description)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {PLAN_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, TariffPlan>(&sql)
            .bind(plan.bot_id.trim())
            .bind(plan.code.trim())
            .bind(&plan.name)
            .bind(plan.price)
            .bind(plan.duration_minutes)
            .bind(plan.voice_minutes)
            .bind(plan.is_trial)
            .bind(&plan.description)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e.as_database_error() {
                Some(db) if db.is_unique_violation() => CoreError::validation(format!(
                    "plan code '{}' already exists for bot '{}'",
                    plan.code, plan.bot_id
                )),
                _ => CoreError::Storage(e),
            })?;

        debug!(plan_id = created.id, "Created tariff plan");
        Ok(created)
    }

    /// Get a plan by its numeric id.
    #[instrument(skip(self))]
    pub async fn get_plan(&self, id: i64) -> CoreResult<Option<TariffPlan>> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM tariff_plans WHERE id = ?");
        let plan = sqlx::query_as::<_, TariffPlan>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    /// Get a plan by the code a user selected.
    #[instrument(skip(self))]
    pub async fn get_plan_by_code(&self, bot_id: &str, code: &str) -> CoreResult<Option<TariffPlan>> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM tariff_plans WHERE bot_id = ? AND code = ?");
        let plan = sqlx::query_as::<_, TariffPlan>(&sql)
            .bind(bot_id)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    /// Get the bot's trial plan, if it offers one.
    #[instrument(skip(self))]
    pub async fn get_trial_plan(&self, bot_id: &str) -> CoreResult<Option<TariffPlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM tariff_plans WHERE bot_id = ? AND is_trial = 1 ORDER BY id LIMIT 1"
        );
        let plan = sqlx::query_as::<_, TariffPlan>(&sql)
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    /// List plans, optionally restricted to one bot, cheapest first.
    #[instrument(skip(self))]
    pub async fn list_plans(&self, bot_id: Option<&str>) -> CoreResult<Vec<TariffPlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM tariff_plans WHERE (?1 IS NULL OR bot_id = ?1) ORDER BY price ASC, id ASC"
        );
        let plans = sqlx::query_as::<_, TariffPlan>(&sql)
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(plans)
    }

    /// Add a minute package.
    #[instrument(skip(self, package), fields(bot_id = %package.bot_id))]
    pub async fn create_package(&self, package: NewMinutePackage) -> CoreResult<MinutePackage> {
        if package.bot_id.trim().is_empty() {
            return Err(CoreError::validation("package bot_id must not be empty"));
        }
        if package.minutes <= 0 {
            return Err(CoreError::validation("package minutes must be positive"));
        }
        if package.price < 0.0 {
            return Err(CoreError::validation("package price must not be negative"));
        }

        let sql = format!(
            r#"
            INSERT INTO minute_packages (bot_id, name, minutes, price, active)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {PACKAGE_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, MinutePackage>(&sql)
            .bind(package.bot_id.trim())
            .bind(&package.name)
            .bind(package.minutes)
            .bind(package.price)
            .bind(package.active)
            .fetch_one(&self.pool)
            .await?;

        debug!(package_id = created.id, "Created minute package");
        Ok(created)
    }

    /// Get a package of the given bot.
    #[instrument(skip(self))]
    pub async fn get_package(&self, bot_id: &str, id: i64) -> CoreResult<Option<MinutePackage>> {
        let sql = format!("SELECT {PACKAGE_COLUMNS} FROM minute_packages WHERE id = ? AND bot_id = ?");
        let package = sqlx::query_as::<_, MinutePackage>(&sql)
            .bind(id)
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(package)
    }

    /// List packages, optionally restricted to one bot, smallest first.
    #[instrument(skip(self))]
    pub async fn list_packages(&self, bot_id: Option<&str>) -> CoreResult<Vec<MinutePackage>> {
        let sql = format!(
            "SELECT {PACKAGE_COLUMNS} FROM minute_packages WHERE (?1 IS NULL OR bot_id = ?1) ORDER BY minutes ASC, id ASC"
        );
        let packages = sqlx::query_as::<_, MinutePackage>(&sql)
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(packages)
    }

    /// Enable or retire a package.
    #[instrument(skip(self))]
    pub async fn set_package_active(
        &self,
        bot_id: &str,
        id: i64,
        active: bool,
    ) -> CoreResult<MinutePackage> {
        let sql = format!(
            "UPDATE minute_packages SET active = ? WHERE id = ? AND bot_id = ? RETURNING {PACKAGE_COLUMNS}"
        );
        sqlx::query_as::<_, MinutePackage>(&sql)
            .bind(active)
            .bind(id)
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("minute package {id} for bot '{bot_id}'")))
    }
}
