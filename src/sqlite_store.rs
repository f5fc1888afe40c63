//! SQLite-backed [`ChunkStore`] and [`GraphStore`] implementation.
//!
//! Vectors are stored as bracketed text (`[0.1,0.2,...]`) and ranked in
//! process by cosine distance. Candidate rows are read in rowid order, which
//! is insertion order, so the stable ranking sort breaks ties oldest first.
//!
//! Every read is filtered by `tenant_id` in SQL and wrapped in a per-call
//! timeout. The write helpers serve the ingestion side (`dgx import`,
//! `dgx embed pending`) and enforce the ownership invariants before
//! inserting.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docgraph_core::embedding::{check_dims, deserialize_vector, rank_by_distance, serialize_vector};
use docgraph_core::models::{
    Chunk, Document, Entity, Relation, ScoredChunk, ScoredEntity, ScoredRelation,
};
use docgraph_core::store::{ChunkStore, GraphStore};

const CHUNK_COLUMNS: &str =
    "id, document_id, tenant_id, workspace, chunk_index, content, token_count, embedding";
const ENTITY_COLUMNS: &str =
    "id, tenant_id, workspace, name, entity_type, description, source_chunk_ids, embedding";
const RELATION_COLUMNS: &str = "id, tenant_id, workspace, source_entity_id, target_entity_id, \
     relation_type, description, source_chunk_ids, embedding";

/// SQLite implementation of the store traits.
pub struct SqliteStore {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// Run one database call under the store's timeout.
    async fn timed<T>(
        &self,
        op: &str,
        fut: impl Future<Output = std::result::Result<T, sqlx::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(res) => res.with_context(|| format!("{} failed", op)),
            Err(_) => bail!(
                "{} timed out after {}s",
                op,
                self.query_timeout.as_secs()
            ),
        }
    }

    // ---- writes (ingestion side) ----

    pub async fn insert_document(&self, doc: &Document, title: Option<&str>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.timed(
            "insert_document",
            sqlx::query(
                "INSERT INTO documents (id, tenant_id, workspace, status, title, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&doc.id)
            .bind(&doc.tenant_id)
            .bind(&doc.workspace)
            .bind(doc.status.as_str())
            .bind(title)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Insert a chunk. Its parent document must exist under the same tenant
    /// and workspace.
    pub async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let workspace: Option<String> = self
            .timed(
                "insert_chunk",
                sqlx::query_scalar("SELECT workspace FROM documents WHERE id = ? AND tenant_id = ?")
                    .bind(&chunk.document_id)
                    .bind(&chunk.tenant_id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        match workspace {
            None => bail!(
                "chunk {}: document {} not found for tenant",
                chunk.id,
                chunk.document_id
            ),
            Some(w) if w != chunk.workspace => {
                bail!("chunk {}: workspace does not match its document", chunk.id)
            }
            Some(_) => {}
        }
        let embedding = encode_optional(chunk.embedding.as_deref())?;

        self.timed(
            "insert_chunk",
            sqlx::query(&format!(
                "INSERT INTO chunks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                CHUNK_COLUMNS
            ))
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.tenant_id)
            .bind(&chunk.workspace)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(embedding)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Insert an entity. Every provenance chunk must belong to its tenant
    /// and workspace.
    pub async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.check_provenance(
            &entity.id,
            &entity.tenant_id,
            &entity.workspace,
            &entity.source_chunk_ids,
        )
        .await?;
        let embedding = encode_optional(entity.embedding.as_deref())?;

        self.timed(
            "insert_entity",
            sqlx::query(&format!(
                "INSERT INTO entities ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                ENTITY_COLUMNS
            ))
            .bind(&entity.id)
            .bind(&entity.tenant_id)
            .bind(&entity.workspace)
            .bind(&entity.name)
            .bind(&entity.entity_type)
            .bind(&entity.description)
            .bind(serde_json::to_string(&entity.source_chunk_ids)?)
            .bind(embedding)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Insert a relation. Both endpoints must exist under its tenant and
    /// workspace.
    pub async fn insert_relation(&self, relation: &Relation) -> Result<()> {
        for endpoint in [&relation.source_entity_id, &relation.target_entity_id] {
            let count: i64 = self
                .timed(
                    "insert_relation",
                    sqlx::query_scalar(
                        "SELECT COUNT(*) FROM entities \
                         WHERE id = ? AND tenant_id = ? AND workspace = ?",
                    )
                    .bind(endpoint)
                    .bind(&relation.tenant_id)
                    .bind(&relation.workspace)
                    .fetch_one(&self.pool),
                )
                .await?;
            if count == 0 {
                bail!(
                    "relation {}: endpoint {} not found in tenant workspace",
                    relation.id,
                    endpoint
                );
            }
        }
        self.check_provenance(
            &relation.id,
            &relation.tenant_id,
            &relation.workspace,
            &relation.source_chunk_ids,
        )
        .await?;
        let embedding = encode_optional(relation.embedding.as_deref())?;

        self.timed(
            "insert_relation",
            sqlx::query(&format!(
                "INSERT INTO relations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RELATION_COLUMNS
            ))
            .bind(&relation.id)
            .bind(&relation.tenant_id)
            .bind(&relation.workspace)
            .bind(&relation.source_entity_id)
            .bind(&relation.target_entity_id)
            .bind(&relation.relation_type)
            .bind(&relation.description)
            .bind(serde_json::to_string(&relation.source_chunk_ids)?)
            .bind(embedding)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn check_provenance(
        &self,
        owner_id: &str,
        tenant: &str,
        workspace: &str,
        chunk_ids: &[String],
    ) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let found = self.get_chunks_by_ids(tenant, chunk_ids).await?;
        let found: HashSet<&str> = found
            .iter()
            .filter(|c| c.workspace == workspace)
            .map(|c| c.id.as_str())
            .collect();
        for id in chunk_ids {
            if !found.contains(id.as_str()) {
                bail!(
                    "{}: provenance chunk {} not found in tenant workspace",
                    owner_id,
                    id
                );
            }
        }
        Ok(())
    }

    /// Replace a row's vector wholesale. `table` is one of the three
    /// embeddable tables.
    pub async fn set_embedding(
        &self,
        table: EmbeddingTarget,
        tenant: &str,
        id: &str,
        vector: &[f32],
    ) -> Result<()> {
        check_dims(vector)?;
        let sql = format!(
            "UPDATE {} SET embedding = ? WHERE id = ? AND tenant_id = ?",
            table.table()
        );
        let result = self
            .timed(
                "set_embedding",
                sqlx::query(&sql)
                    .bind(serialize_vector(vector))
                    .bind(id)
                    .bind(tenant)
                    .execute(&self.pool),
            )
            .await?;
        if result.rows_affected() == 0 {
            bail!("{} {} not found for tenant", table.table(), id);
        }
        Ok(())
    }

    pub async fn chunks_missing_embeddings(
        &self,
        tenant: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Chunk>> {
        let rows = self
            .missing_rows(EmbeddingTarget::Chunks, CHUNK_COLUMNS, tenant, limit)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn entities_missing_embeddings(
        &self,
        tenant: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Entity>> {
        let rows = self
            .missing_rows(EmbeddingTarget::Entities, ENTITY_COLUMNS, tenant, limit)
            .await?;
        rows.iter().map(entity_from_row).collect()
    }

    pub async fn relations_missing_embeddings(
        &self,
        tenant: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Relation>> {
        let rows = self
            .missing_rows(EmbeddingTarget::Relations, RELATION_COLUMNS, tenant, limit)
            .await?;
        rows.iter().map(relation_from_row).collect()
    }

    async fn missing_rows(
        &self,
        target: EmbeddingTarget,
        columns: &str,
        tenant: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<SqliteRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE embedding IS NULL AND (? IS NULL OR tenant_id = ?) \
             ORDER BY rowid LIMIT ?",
            columns,
            target.table()
        );
        self.timed(
            "list_missing_embeddings",
            sqlx::query(&sql)
                .bind(tenant)
                .bind(tenant)
                .bind(limit.unwrap_or(-1))
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn similar_rows(
        &self,
        op: &str,
        target: EmbeddingTarget,
        columns: &str,
        tenant: &str,
        workspace: &str,
    ) -> Result<Vec<SqliteRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE tenant_id = ? AND workspace = ? \
             AND embedding IS NOT NULL ORDER BY rowid",
            columns,
            target.table()
        );
        self.timed(
            op,
            sqlx::query(&sql)
                .bind(tenant)
                .bind(workspace)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn rows_by_ids(
        &self,
        op: &str,
        target: EmbeddingTarget,
        columns: &str,
        tenant: &str,
        ids: &[String],
    ) -> Result<Vec<SqliteRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE tenant_id = ? AND id IN ({})",
            columns,
            target.table(),
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(tenant);
        for id in ids {
            query = query.bind(id);
        }
        self.timed(op, query.fetch_all(&self.pool)).await
    }
}

/// Tables that carry an `embedding` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTarget {
    Chunks,
    Entities,
    Relations,
}

impl EmbeddingTarget {
    fn table(&self) -> &'static str {
        match self {
            EmbeddingTarget::Chunks => "chunks",
            EmbeddingTarget::Entities => "entities",
            EmbeddingTarget::Relations => "relations",
        }
    }
}

fn encode_optional(vector: Option<&[f32]>) -> Result<Option<String>> {
    match vector {
        Some(v) => {
            check_dims(v)?;
            Ok(Some(serialize_vector(v)))
        }
        None => Ok(None),
    }
}

fn decode_optional(row: &SqliteRow) -> Result<Option<Vec<f32>>> {
    let text: Option<String> = row.get("embedding");
    text.map(|t| deserialize_vector(&t)).transpose()
}

fn decode_ids(row: &SqliteRow) -> Result<Vec<String>> {
    let json: String = row.get("source_chunk_ids");
    serde_json::from_str(&json).context("malformed source_chunk_ids")
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        tenant_id: row.get("tenant_id"),
        workspace: row.get("workspace"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        embedding: decode_optional(row)?,
    })
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    Ok(Entity {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        workspace: row.get("workspace"),
        name: row.get("name"),
        entity_type: row.get("entity_type"),
        description: row.get("description"),
        source_chunk_ids: decode_ids(row)?,
        embedding: decode_optional(row)?,
    })
}

fn relation_from_row(row: &SqliteRow) -> Result<Relation> {
    Ok(Relation {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        workspace: row.get("workspace"),
        source_entity_id: row.get("source_entity_id"),
        target_entity_id: row.get("target_entity_id"),
        relation_type: row.get("relation_type"),
        description: row.get("description"),
        source_chunk_ids: decode_ids(row)?,
        embedding: decode_optional(row)?,
    })
}

/// Decode candidate rows, skipping any whose stored vector is unusable.
fn candidates<T>(
    rows: &[SqliteRow],
    decode: impl Fn(&SqliteRow) -> Result<T>,
    vector_of: impl Fn(&T) -> Option<Vec<f32>>,
) -> Vec<(T, Vec<f32>)> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match decode(row) {
            Ok(item) => match vector_of(&item) {
                Some(v) if check_dims(&v).is_ok() => out.push((item, v)),
                _ => {
                    let id: String = row.get("id");
                    tracing::warn!(id = %id, "skipping row with unusable embedding");
                }
            },
            Err(e) => {
                let id: String = row.get("id");
                tracing::warn!(id = %id, error = %e, "skipping undecodable row");
            }
        }
    }
    out
}

/// Order `rows` by the position of their id in `ids`, dropping duplicates.
fn in_id_order<T>(rows: Vec<T>, ids: &[String], id_of: impl Fn(&T) -> &str) -> Vec<T> {
    let mut by_id: HashMap<String, T> = rows
        .into_iter()
        .map(|r| (id_of(&r).to_string(), r))
        .collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn find_similar_chunks(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = self
            .similar_rows(
                "find_similar_chunks",
                EmbeddingTarget::Chunks,
                CHUNK_COLUMNS,
                tenant,
                workspace,
            )
            .await?;
        let items = candidates(&rows, chunk_from_row, |c| c.embedding.clone());
        Ok(rank_by_distance(query_vec, items, k)
            .into_iter()
            .map(|(chunk, distance)| ScoredChunk { chunk, distance })
            .collect())
    }

    async fn get_chunks_by_ids(&self, tenant: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        let rows = self
            .rows_by_ids(
                "get_chunks_by_ids",
                EmbeddingTarget::Chunks,
                CHUNK_COLUMNS,
                tenant,
                ids,
            )
            .await?;
        let chunks = rows.iter().map(chunk_from_row).collect::<Result<Vec<_>>>()?;
        Ok(in_id_order(chunks, ids, |c| c.id.as_str()))
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn find_similar_entities(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredEntity>> {
        let rows = self
            .similar_rows(
                "find_similar_entities",
                EmbeddingTarget::Entities,
                ENTITY_COLUMNS,
                tenant,
                workspace,
            )
            .await?;
        let items = candidates(&rows, entity_from_row, |e| e.embedding.clone());
        Ok(rank_by_distance(query_vec, items, k)
            .into_iter()
            .map(|(entity, distance)| ScoredEntity { entity, distance })
            .collect())
    }

    async fn find_similar_relations(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredRelation>> {
        let rows = self
            .similar_rows(
                "find_similar_relations",
                EmbeddingTarget::Relations,
                RELATION_COLUMNS,
                tenant,
                workspace,
            )
            .await?;
        let items = candidates(&rows, relation_from_row, |r| r.embedding.clone());
        Ok(rank_by_distance(query_vec, items, k)
            .into_iter()
            .map(|(relation, distance)| ScoredRelation { relation, distance })
            .collect())
    }

    async fn get_entities_by_ids(&self, tenant: &str, ids: &[String]) -> Result<Vec<Entity>> {
        let rows = self
            .rows_by_ids(
                "get_entities_by_ids",
                EmbeddingTarget::Entities,
                ENTITY_COLUMNS,
                tenant,
                ids,
            )
            .await?;
        let entities = rows.iter().map(entity_from_row).collect::<Result<Vec<_>>>()?;
        Ok(in_id_order(entities, ids, |e| e.id.as_str()))
    }
}
