//! Subscription plans: mode entitlements and per-tenant plan lookup.
//!
//! [`PlanCatalog`] is built once from `[plans.<name>]` config tables and
//! answers [`ModeEntitlements`] queries. [`SqlitePlanService`] maps tenants
//! to plan names via the `tenant_plans` table, falling back to
//! `default_plan`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use docgraph_core::mode::{ModeEntitlements, RetrievalMode};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub modes: Vec<RetrievalMode>,
    /// `None` means unlimited.
    pub monthly_queries: Option<u64>,
}

/// All configured plans.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: BTreeMap<String, Plan>,
}

impl PlanCatalog {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut plans = BTreeMap::new();
        for (name, plan) in &config.plans {
            let modes = plan
                .modes
                .iter()
                .map(|m| {
                    m.parse::<RetrievalMode>()
                        .with_context(|| format!("plans.{}.modes", name))
                })
                .collect::<Result<Vec<_>>>()?;
            plans.insert(
                name.clone(),
                Plan {
                    modes,
                    monthly_queries: plan.monthly_queries,
                },
            );
        }
        Ok(Self { plans })
    }

    pub fn insert(&mut self, name: impl Into<String>, plan: Plan) {
        self.plans.insert(name.into(), plan);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plans.contains_key(name)
    }

    /// Query allowance for `plan`. Unknown plans are unlimited.
    pub fn monthly_queries(&self, plan: &str) -> Option<u64> {
        self.plans.get(plan).and_then(|p| p.monthly_queries)
    }
}

impl ModeEntitlements for PlanCatalog {
    fn is_mode_available(&self, plan: &str, mode: RetrievalMode) -> bool {
        mode == RetrievalMode::Naive
            || self
                .plans
                .get(plan)
                .map(|p| p.modes.contains(&mode))
                .unwrap_or(false)
    }
}

/// Resolves the plan a tenant is subscribed to.
#[async_trait]
pub trait PlanService: Send + Sync {
    async fn plan_name(&self, tenant: &str) -> Result<String>;
}

pub struct SqlitePlanService {
    pool: SqlitePool,
    default_plan: String,
}

impl SqlitePlanService {
    pub fn new(pool: SqlitePool, default_plan: impl Into<String>) -> Self {
        Self {
            pool,
            default_plan: default_plan.into(),
        }
    }

    /// Assign `plan` to `tenant`, replacing any previous assignment.
    pub async fn set_plan(&self, tenant: &str, plan: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO tenant_plans (tenant_id, plan, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                plan = excluded.plan,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant)
        .bind(plan)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PlanService for SqlitePlanService {
    async fn plan_name(&self, tenant: &str) -> Result<String> {
        let plan: Option<String> =
            sqlx::query_scalar("SELECT plan FROM tenant_plans WHERE tenant_id = ?")
                .bind(tenant)
                .fetch_optional(&self.pool)
                .await
                .context("plan lookup failed")?;
        Ok(plan.unwrap_or_else(|| self.default_plan.clone()))
    }
}

/// `dgx plan set`: assign a configured plan to a tenant.
pub async fn run_plan_set(config: &Config, tenant: &str, plan: &str) -> Result<()> {
    let tenant = tenant.trim();
    if tenant.is_empty() {
        anyhow::bail!("tenant must not be empty");
    }
    let catalog = PlanCatalog::from_config(config)?;
    if !catalog.contains(plan) {
        anyhow::bail!(
            "unknown plan '{}'; configured plans: {}",
            plan,
            config.plans.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }

    let pool = crate::db::connect(config).await?;
    let service = SqlitePlanService::new(pool.clone(), config.default_plan.clone());
    service.set_plan(tenant, plan).await?;
    pool.close().await;

    tracing::info!(tenant, plan, "plan assigned");
    println!("{} -> {}", tenant, plan);
    Ok(())
}

/// `dgx plan show`: print a tenant's plan, its modes, and this month's usage.
pub async fn run_plan_show(config: &Config, tenant: &str) -> Result<()> {
    let catalog = std::sync::Arc::new(PlanCatalog::from_config(config)?);
    let pool = crate::db::connect(config).await?;
    let plans = SqlitePlanService::new(pool.clone(), config.default_plan.clone());
    let plan = plans.plan_name(tenant).await?;

    let usage = crate::usage::SqliteUsageService::new(pool.clone(), catalog.clone());
    let period = crate::usage::current_period();
    let record = usage.usage_for(tenant, &period).await?;
    pool.close().await;

    let modes: Vec<&str> = docgraph_core::mode::available_modes(&plan, catalog.as_ref())
        .iter()
        .map(|m| m.as_str())
        .collect();
    let quota = catalog
        .monthly_queries(&plan)
        .map(|q| q.to_string())
        .unwrap_or_else(|| "unlimited".to_string());

    println!("tenant: {}", tenant);
    println!("  plan: {}", plan);
    println!("  modes: {}", modes.join(", "));
    println!("  queries ({}): {} / {}", period, record.queries, quota);
    println!(
        "  tokens ({}): {} prompt, {} completion",
        period, record.prompt_tokens, record.completion_tokens
    );
    Ok(())
}
