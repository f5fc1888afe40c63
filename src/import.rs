//! Load pre-extracted documents, chunks, and graph rows from a JSON snapshot.
//!
//! Chunking and entity extraction happen upstream; this command only
//! persists their output under one tenant. Every row goes through the
//! store's write helpers, so ownership and vector-width invariants are
//! checked on the way in.
//!
//! ```json
//! {
//!   "documents": [
//!     { "id": "doc-1", "title": "Refunds", "chunks": [
//!         { "chunk_index": 0, "content": "Refunds are issued within 30 days." }
//!     ] }
//!   ],
//!   "entities": [
//!     { "id": "e1", "name": "Refund Policy", "entity_type": "policy",
//!       "source_chunk_ids": ["doc-1:0"] }
//!   ],
//!   "relations": []
//! }
//! ```
//!
//! Chunks without an explicit `id` get `"{document_id}:{chunk_index}"`.
//! Ids only need to be unique within the tenant, so the same snapshot can be
//! imported for several tenants. Graph rows may only cite chunks and
//! entities in their own workspace.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use docgraph_core::models::{Chunk, Document, DocumentStatus, Entity, Relation};
use docgraph_core::query::DEFAULT_WORKSPACE;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub documents: Vec<SnapshotDocument>,
    #[serde(default)]
    pub entities: Vec<SnapshotEntity>,
    #[serde(default)]
    pub relations: Vec<SnapshotRelation>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotDocument {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub chunks: Vec<SnapshotChunk>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotChunk {
    #[serde(default)]
    pub id: Option<String>,
    pub chunk_index: i64,
    pub content: String,
    #[serde(default)]
    pub token_count: Option<i64>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRelation {
    pub id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relation_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub documents: usize,
    pub chunks: usize,
    pub entities: usize,
    pub relations: usize,
}

/// Rough token estimate used when a chunk carries no `token_count`.
fn estimate_tokens(content: &str) -> i64 {
    content.chars().count().div_ceil(4) as i64
}

pub async fn run_import(
    config: &Config,
    path: &Path,
    tenant: &str,
    workspace: Option<&str>,
) -> Result<ImportSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(
        pool.clone(),
        Duration::from_secs(config.db.query_timeout_secs),
    );
    let summary = import_snapshot(&store, &snapshot, tenant, workspace).await?;

    println!("import {}", path.display());
    println!("  tenant: {}", tenant);
    println!("  documents: {}", summary.documents);
    println!("  chunks: {}", summary.chunks);
    println!("  entities: {}", summary.entities);
    println!("  relations: {}", summary.relations);

    pool.close().await;
    Ok(summary)
}

/// Write `snapshot` into `store` as rows owned by `tenant`.
pub async fn import_snapshot(
    store: &SqliteStore,
    snapshot: &Snapshot,
    tenant: &str,
    workspace: Option<&str>,
) -> Result<ImportSummary> {
    let tenant = tenant.trim();
    if tenant.is_empty() {
        anyhow::bail!("tenant must not be empty");
    }
    let default_ws = workspace.unwrap_or(DEFAULT_WORKSPACE);
    let mut summary = ImportSummary::default();

    for d in &snapshot.documents {
        let ws = d.workspace.as_deref().unwrap_or(default_ws).to_string();
        let doc = Document {
            id: d.id.clone(),
            tenant_id: tenant.to_string(),
            workspace: ws.clone(),
            status: DocumentStatus::Processed,
        };
        store
            .insert_document(&doc, d.title.as_deref())
            .await
            .with_context(|| format!("document {}", d.id))?;
        summary.documents += 1;

        for c in &d.chunks {
            let chunk = Chunk {
                id: c
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", d.id, c.chunk_index)),
                document_id: d.id.clone(),
                tenant_id: tenant.to_string(),
                workspace: ws.clone(),
                chunk_index: c.chunk_index,
                content: c.content.clone(),
                token_count: c.token_count.unwrap_or_else(|| estimate_tokens(&c.content)),
                embedding: c.embedding.clone(),
            };
            store
                .insert_chunk(&chunk)
                .await
                .with_context(|| format!("chunk {}", chunk.id))?;
            summary.chunks += 1;
        }
    }

    for e in &snapshot.entities {
        let entity = Entity {
            id: e.id.clone(),
            tenant_id: tenant.to_string(),
            workspace: e.workspace.as_deref().unwrap_or(default_ws).to_string(),
            name: e.name.clone(),
            entity_type: e.entity_type.clone(),
            description: e.description.clone(),
            source_chunk_ids: e.source_chunk_ids.clone(),
            embedding: e.embedding.clone(),
        };
        store
            .insert_entity(&entity)
            .await
            .with_context(|| format!("entity {}", e.id))?;
        summary.entities += 1;
    }

    for r in &snapshot.relations {
        let relation = Relation {
            id: r.id.clone(),
            tenant_id: tenant.to_string(),
            workspace: r.workspace.as_deref().unwrap_or(default_ws).to_string(),
            source_entity_id: r.source_entity_id.clone(),
            target_entity_id: r.target_entity_id.clone(),
            relation_type: r.relation_type.clone(),
            description: r.description.clone(),
            source_chunk_ids: r.source_chunk_ids.clone(),
            embedding: r.embedding.clone(),
        };
        store
            .insert_relation(&relation)
            .await
            .with_context(|| format!("relation {}", r.id))?;
        summary.relations += 1;
    }

    tracing::info!(
        tenant,
        documents = summary.documents,
        chunks = summary.chunks,
        entities = summary.entities,
        relations = summary.relations,
        "snapshot imported"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_defaults() {
        let snapshot: Snapshot = serde_json::from_str(
            r#"{ "documents": [ { "id": "d1", "chunks": [ { "chunk_index": 0, "content": "abcdefgh" } ] } ] }"#,
        )
        .unwrap();
        assert_eq!(snapshot.documents[0].chunks[0].token_count, None);
        assert!(snapshot.entities.is_empty());
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }
}
