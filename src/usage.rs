//! Per-tenant usage counters and query quota checks.
//!
//! Counters live in the `usage` table keyed by tenant and calendar month
//! (`YYYY-MM`, UTC). The quota is the plan's `monthly_queries`; plans
//! without one are unlimited.
//!
//! Queries are counted by reservation: [`UsageService::reserve_query`]
//! claims a slot in one conditional upsert, so concurrent requests cannot
//! overshoot the quota, and [`UsageService::release_query`] returns the
//! slot when the query fails.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use docgraph_core::models::TokenUsage;

use crate::plans::PlanCatalog;

#[async_trait]
pub trait UsageService: Send + Sync {
    /// Whether `tenant`, subscribed to `plan`, may run another query.
    async fn check_query_quota(&self, tenant: &str, plan: &str) -> Result<bool>;

    async fn increment_query_usage(&self, tenant: &str) -> Result<()>;

    async fn increment_token_usage(&self, tenant: &str, usage: &TokenUsage) -> Result<()>;

    /// Claim one query against the quota. Returns `false` when exhausted.
    ///
    /// The default checks then counts, which is only atomic for callers
    /// that never race. Backends with shared state override it.
    async fn reserve_query(&self, tenant: &str, plan: &str) -> Result<bool> {
        if !self.check_query_quota(tenant, plan).await? {
            return Ok(false);
        }
        self.increment_query_usage(tenant).await?;
        Ok(true)
    }

    /// Give back a reserved query that produced no answer.
    async fn release_query(&self, tenant: &str) -> Result<()>;
}

/// One tenant's counters for one month.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageRecord {
    pub period: String,
    pub queries: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub fn current_period() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

pub struct SqliteUsageService {
    pool: SqlitePool,
    catalog: Arc<PlanCatalog>,
}

impl SqliteUsageService {
    pub fn new(pool: SqlitePool, catalog: Arc<PlanCatalog>) -> Self {
        Self { pool, catalog }
    }

    pub async fn usage_for(&self, tenant: &str, period: &str) -> Result<UsageRecord> {
        let row = sqlx::query(
            "SELECT queries, prompt_tokens, completion_tokens FROM usage \
             WHERE tenant_id = ? AND period = ?",
        )
        .bind(tenant)
        .bind(period)
        .fetch_optional(&self.pool)
        .await
        .context("usage lookup failed")?;

        Ok(match row {
            Some(r) => UsageRecord {
                period: period.to_string(),
                queries: r.get::<i64, _>("queries") as u64,
                prompt_tokens: r.get::<i64, _>("prompt_tokens") as u64,
                completion_tokens: r.get::<i64, _>("completion_tokens") as u64,
            },
            None => UsageRecord {
                period: period.to_string(),
                ..Default::default()
            },
        })
    }

    async fn bump(&self, tenant: &str, queries: i64, prompt: i64, completion: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage (tenant_id, period, queries, prompt_tokens, completion_tokens)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, period) DO UPDATE SET
                queries = queries + excluded.queries,
                prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                completion_tokens = completion_tokens + excluded.completion_tokens
            "#,
        )
        .bind(tenant)
        .bind(current_period())
        .bind(queries)
        .bind(prompt)
        .bind(completion)
        .execute(&self.pool)
        .await
        .context("usage update failed")?;
        Ok(())
    }
}

#[async_trait]
impl UsageService for SqliteUsageService {
    async fn check_query_quota(&self, tenant: &str, plan: &str) -> Result<bool> {
        let limit = match self.catalog.monthly_queries(plan) {
            Some(limit) => limit,
            None => return Ok(true),
        };
        let used = self.usage_for(tenant, &current_period()).await?.queries;
        Ok(used < limit)
    }

    async fn increment_query_usage(&self, tenant: &str) -> Result<()> {
        self.bump(tenant, 1, 0, 0).await
    }

    async fn increment_token_usage(&self, tenant: &str, usage: &TokenUsage) -> Result<()> {
        self.bump(
            tenant,
            0,
            usage.prompt_tokens as i64,
            usage.completion_tokens as i64,
        )
        .await
    }

    async fn reserve_query(&self, tenant: &str, plan: &str) -> Result<bool> {
        let limit = match self.catalog.monthly_queries(plan) {
            Some(limit) => limit,
            None => {
                self.bump(tenant, 1, 0, 0).await?;
                return Ok(true);
            }
        };
        if limit == 0 {
            return Ok(false);
        }
        // The upsert's WHERE skips the update once the limit is reached,
        // leaving zero rows affected.
        let result = sqlx::query(
            r#"
            INSERT INTO usage (tenant_id, period, queries) VALUES (?, ?, 1)
            ON CONFLICT(tenant_id, period) DO UPDATE SET queries = queries + 1
            WHERE queries < ?
            "#,
        )
        .bind(tenant)
        .bind(current_period())
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .context("usage reservation failed")?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_query(&self, tenant: &str) -> Result<()> {
        sqlx::query(
            "UPDATE usage SET queries = queries - 1 \
             WHERE tenant_id = ? AND period = ? AND queries > 0",
        )
        .bind(tenant)
        .bind(current_period())
        .execute(&self.pool)
        .await
        .context("usage release failed")?;
        Ok(())
    }
}
