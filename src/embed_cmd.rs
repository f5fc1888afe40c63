use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};

use docgraph_core::store::GraphStore;

use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::progress::ProgressMode;
use crate::sqlite_store::{EmbeddingTarget, SqliteStore};

/// Counts for one kind of row.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedCounts {
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
}

/// Outcome of `dgx embed pending`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedSummary {
    pub chunks: EmbedCounts,
    pub entities: EmbedCounts,
    pub relations: EmbedCounts,
}

/// Find chunks, entities, and relations without a vector and embed them.
///
/// `limit` applies to each kind separately. Texts that fail every attempt
/// are left without a vector and picked up again on the next run.
pub async fn run_embed_pending(
    config: &Config,
    tenant: Option<&str>,
    limit: Option<usize>,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<EmbedSummary> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let client = EmbeddingClient::from_config(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(
        pool.clone(),
        Duration::from_secs(config.db.query_timeout_secs),
    );
    let limit = limit.map(|l| l as i64);

    let chunks = store.chunks_missing_embeddings(tenant, limit).await?;
    let entities = store.entities_missing_embeddings(tenant, limit).await?;
    let relations = store.relations_missing_embeddings(tenant, limit).await?;

    let mut summary = EmbedSummary::default();
    summary.chunks.pending = chunks.len();
    summary.entities.pending = entities.len();
    summary.relations.pending = relations.len();

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", chunks.len());
        println!("  entities needing embeddings: {}", entities.len());
        println!("  relations needing embeddings: {}", relations.len());
        pool.close().await;
        return Ok(summary);
    }

    let reporter = progress.reporter();

    let rows: Vec<(String, String, String)> = chunks
        .into_iter()
        .map(|c| (c.tenant_id, c.id, c.content))
        .collect();
    summary.chunks = embed_rows(&client, &store, EmbeddingTarget::Chunks, rows, &*reporter).await?;

    let rows = entities
        .into_iter()
        .map(|e| {
            let text = e.embedding_text();
            (e.tenant_id, e.id, text)
        })
        .collect();
    summary.entities =
        embed_rows(&client, &store, EmbeddingTarget::Entities, rows, &*reporter).await?;

    let mut rows = Vec::with_capacity(relations.len());
    for r in relations {
        let ids = vec![r.source_entity_id.clone(), r.target_entity_id.clone()];
        let names: HashMap<String, String> = store
            .get_entities_by_ids(&r.tenant_id, &ids)
            .await?
            .into_iter()
            .map(|e| (e.id, e.name))
            .collect();
        let source = names.get(&r.source_entity_id).unwrap_or(&r.source_entity_id);
        let target = names.get(&r.target_entity_id).unwrap_or(&r.target_entity_id);
        let text = r.embedding_text(source, target);
        rows.push((r.tenant_id, r.id, text));
    }
    summary.relations =
        embed_rows(&client, &store, EmbeddingTarget::Relations, rows, &*reporter).await?;

    println!("embed pending");
    for (label, counts) in [
        ("chunks", summary.chunks),
        ("entities", summary.entities),
        ("relations", summary.relations),
    ] {
        println!(
            "  {}: {} pending, {} embedded, {} failed",
            label, counts.pending, counts.embedded, counts.failed
        );
    }

    pool.close().await;
    Ok(summary)
}

/// Embed `(tenant, id, text)` rows and write back the vectors that succeeded.
async fn embed_rows(
    client: &EmbeddingClient,
    store: &SqliteStore,
    target: EmbeddingTarget,
    rows: Vec<(String, String, String)>,
    reporter: &dyn crate::progress::EmbedProgressReporter,
) -> Result<EmbedCounts> {
    let mut counts = EmbedCounts {
        pending: rows.len(),
        ..Default::default()
    };
    if rows.is_empty() {
        return Ok(counts);
    }

    let texts: Vec<String> = rows.iter().map(|(_, _, text)| text.clone()).collect();
    let vectors = client.embed_batch(&texts, reporter).await?;

    for ((tenant, id, _), vector) in rows.iter().zip(vectors.iter()) {
        if vector.is_empty() {
            counts.failed += 1;
            continue;
        }
        store.set_embedding(target, tenant, id, vector).await?;
        counts.embedded += 1;
    }
    Ok(counts)
}
