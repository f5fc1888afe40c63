//! The `execute_query` boundary.
//!
//! [`QueryService`] owns every collaborator a query needs, all built once
//! at startup and shared by reference. A query runs strictly in sequence:
//!
//! ```text
//! validate → plan lookup → reserve quota → resolve mode
//!          → retrieve → synthesize → record tokens → result
//! ```
//!
//! A failed retrieval or synthesis releases the reserved query, so only
//! answered queries count against the plan.
//!
//! Validation happens before any external call, so malformed requests never
//! touch the embedding service or the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;

use docgraph_core::embedding::Embedder;
use docgraph_core::error::QueryError;
use docgraph_core::mode::{available_modes, resolve_mode, ModeEntitlements, ModeFallback, RetrievalMode};
use docgraph_core::query::{QueryRequest, QueryResult};
use docgraph_core::retrieval::{RetrievalEngine, RetrievalParams};
use docgraph_core::store::{ChunkStore, GraphStore};
use docgraph_core::synthesize::{CompletionService, SynthesisSettings, Synthesizer};

use crate::completion::create_completion;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::plans::{PlanCatalog, PlanService, SqlitePlanService};
use crate::sqlite_store::SqliteStore;
use crate::usage::{SqliteUsageService, UsageService};

/// Collaborators injected into a [`QueryService`].
pub struct QueryDeps {
    pub chunks: Arc<dyn ChunkStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn Embedder>,
    pub completion: Arc<dyn CompletionService>,
    pub entitlements: Arc<dyn ModeEntitlements>,
    pub plans: Arc<dyn PlanService>,
    pub usage: Arc<dyn UsageService>,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub retrieval: RetrievalParams,
    pub synthesis: SynthesisSettings,
    pub default_top_k: usize,
    pub max_top_k: usize,
}

impl QuerySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retrieval: RetrievalParams {
                entity_top_k: config.retrieval.entity_top_k,
                relation_top_k: config.retrieval.relation_top_k,
            },
            synthesis: SynthesisSettings {
                max_context_tokens: config.retrieval.max_context_tokens,
                system_prompt: config.completion.system_prompt.clone(),
            },
            default_top_k: config.retrieval.default_top_k,
            max_top_k: config.retrieval.max_top_k,
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            retrieval: RetrievalParams::default(),
            synthesis: SynthesisSettings::default(),
            default_top_k: docgraph_core::query::DEFAULT_TOP_K,
            max_top_k: docgraph_core::query::MAX_TOP_K,
        }
    }
}

/// Modes a tenant may use, for `GET /v1/modes`.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantModes {
    pub plan: String,
    pub modes: Vec<RetrievalMode>,
}

pub struct QueryService {
    engine: RetrievalEngine,
    synthesizer: Synthesizer,
    entitlements: Arc<dyn ModeEntitlements>,
    plans: Arc<dyn PlanService>,
    usage: Arc<dyn UsageService>,
    default_top_k: usize,
    max_top_k: usize,
}

impl QueryService {
    pub fn new(deps: QueryDeps, settings: QuerySettings) -> Self {
        Self {
            engine: RetrievalEngine::new(deps.chunks, deps.graph, deps.embedder, settings.retrieval),
            synthesizer: Synthesizer::new(deps.completion, settings.synthesis),
            entitlements: deps.entitlements,
            plans: deps.plans,
            usage: deps.usage,
            default_top_k: settings.default_top_k,
            max_top_k: settings.max_top_k,
        }
    }

    /// Wire the SQLite-backed services and configured providers.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(
            pool.clone(),
            Duration::from_secs(config.db.query_timeout_secs),
        ));
        let catalog = Arc::new(PlanCatalog::from_config(config)?);
        let deps = QueryDeps {
            chunks: store.clone(),
            graph: store,
            embedder: Arc::new(EmbeddingClient::from_config(&config.embedding)?),
            completion: create_completion(&config.completion)?,
            entitlements: catalog.clone(),
            plans: Arc::new(SqlitePlanService::new(
                pool.clone(),
                config.default_plan.clone(),
            )),
            usage: Arc::new(SqliteUsageService::new(pool, catalog)),
        };
        Ok(Self::new(deps, QuerySettings::from_config(config)))
    }

    /// Answer `request` for `tenant`.
    pub async fn execute_query(
        &self,
        tenant: &str,
        request: &QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let tenant = tenant.trim();
        if tenant.is_empty() {
            return Err(QueryError::validation("tenant must not be empty"));
        }
        let query = request.validate_with(self.default_top_k, self.max_top_k)?;

        let plan = self
            .plans
            .plan_name(tenant)
            .await
            .map_err(QueryError::store)?;

        // The quota slot is claimed up front so concurrent requests cannot
        // all pass the check. It is given back if no answer is produced.
        let reserved = self
            .usage
            .reserve_query(tenant, &plan)
            .await
            .map_err(QueryError::store)?;
        if !reserved {
            tracing::warn!(tenant, plan = %plan, "query quota exceeded");
            return Err(QueryError::QuotaExceeded {
                tenant: tenant.to_string(),
            });
        }

        let resolution = resolve_mode(query.mode.as_deref(), &plan, self.entitlements.as_ref());
        match &resolution.fallback {
            ModeFallback::None | ModeFallback::Unspecified => {}
            ModeFallback::Invalid(requested) => {
                tracing::warn!(tenant, requested = %requested, "unknown mode, using naive");
            }
            ModeFallback::NotEntitled { requested, plan } => {
                tracing::warn!(
                    tenant,
                    requested = %requested,
                    plan = %plan,
                    "mode not in plan, using naive"
                );
            }
        }
        let mode = resolution.effective;

        let outcome = async {
            let context = self
                .engine
                .retrieve(tenant, &query.workspace, &query.query, mode, query.top_k)
                .await?;
            let answer = self
                .synthesizer
                .synthesize(
                    &query.query,
                    &context,
                    query.system_prompt.as_deref(),
                    query.model.as_deref(),
                )
                .await?;
            Ok::<_, QueryError>(answer)
        }
        .await;

        let answer = match outcome {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(release) = self.usage.release_query(tenant).await {
                    tracing::warn!(
                        tenant,
                        error = %format!("{:#}", release),
                        "failed to release query reservation"
                    );
                }
                return Err(e);
            }
        };

        // The answer exists; a bookkeeping failure must not discard it.
        if let Some(ref usage) = answer.token_usage {
            if let Err(e) = self.usage.increment_token_usage(tenant, usage).await {
                tracing::warn!(tenant, error = %format!("{:#}", e), "failed to record token usage");
            }
        }

        tracing::info!(
            tenant,
            mode = %mode,
            workspace = %query.workspace,
            top_k = query.top_k,
            sources = answer.sources.len(),
            entities = answer.entities.len(),
            total_tokens = answer.token_usage.map(|u| u.total_tokens).unwrap_or(0),
            "query answered"
        );

        Ok(QueryResult {
            response: answer.text,
            sources: answer.sources,
            entities: answer.entities,
            mode_used: mode.as_str().to_string(),
            token_usage: answer.token_usage,
        })
    }

    /// The calling tenant's plan and the modes it unlocks.
    pub async fn tenant_modes(&self, tenant: &str) -> Result<TenantModes, QueryError> {
        let plan = self
            .plans
            .plan_name(tenant)
            .await
            .map_err(QueryError::store)?;
        let modes = available_modes(&plan, self.entitlements.as_ref());
        Ok(TenantModes { plan, modes })
    }
}

/// `dgx query`: answer one query and print it.
pub async fn run_query(
    config: &Config,
    tenant: &str,
    request: &QueryRequest,
    json: bool,
) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    let service = QueryService::from_config(config, pool.clone())?;
    let result = service.execute_query(tenant, request).await;
    pool.close().await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("{}", result.response.trim());
    println!();
    println!("mode: {}", result.mode_used);
    if !result.sources.is_empty() {
        println!("sources:");
        for (i, s) in result.sources.iter().enumerate() {
            let score = s
                .score
                .map(|v| format!("  score={:.3}", v))
                .unwrap_or_default();
            println!(
                "  [{}] {} (document {}, chunk {}){}",
                i + 1,
                s.chunk_id,
                s.document_id,
                s.chunk_index,
                score
            );
        }
    }
    if !result.entities.is_empty() {
        println!("entities:");
        for e in &result.entities {
            println!("  {} ({})", e.name, e.entity_type);
        }
    }
    if let Some(u) = result.token_usage {
        println!(
            "tokens: {} prompt, {} completion, {} total",
            u.prompt_tokens, u.completion_tokens, u.total_tokens
        );
    }
    Ok(())
}
