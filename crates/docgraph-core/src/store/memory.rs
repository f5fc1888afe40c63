//! In-memory [`ChunkStore`] and [`GraphStore`] for tests and embedding hosts.
//!
//! Uses `Vec`s behind `std::sync::RwLock`; insertion order is the vector
//! order, which gives oldest-first tie breaking for free. Similarity search
//! is brute-force cosine distance.
//!
//! The insert methods enforce the same ownership invariants as the SQLite
//! store. Ids are unique per tenant, not globally. A chunk lives in its
//! document's tenant and workspace; entity and relation provenance, and
//! relation endpoints, stay within the row's tenant and workspace.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::{check_dims, rank_by_distance};
use crate::models::{
    Chunk, Document, Entity, Relation, ScoredChunk, ScoredEntity, ScoredRelation,
};

use super::{ChunkStore, GraphStore};

/// In-memory store for testing.
pub struct InMemoryStore {
    documents: RwLock<Vec<Document>>,
    chunks: RwLock<Vec<Chunk>>,
    entities: RwLock<Vec<Entity>>,
    relations: RwLock<Vec<Relation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(Vec::new()),
            chunks: RwLock::new(Vec::new()),
            entities: RwLock::new(Vec::new()),
            relations: RwLock::new(Vec::new()),
        }
    }

    pub fn insert_document(&self, doc: Document) -> Result<()> {
        let mut docs = self.documents.write().unwrap();
        if docs
            .iter()
            .any(|d| d.id == doc.id && d.tenant_id == doc.tenant_id)
        {
            bail!("document {} already exists", doc.id);
        }
        docs.push(doc);
        Ok(())
    }

    pub fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
        {
            let docs = self.documents.read().unwrap();
            let doc = docs
                .iter()
                .find(|d| d.id == chunk.document_id && d.tenant_id == chunk.tenant_id);
            let doc = match doc {
                Some(d) => d,
                None => bail!(
                    "chunk {}: document {} not found for tenant",
                    chunk.id,
                    chunk.document_id
                ),
            };
            if doc.workspace != chunk.workspace {
                bail!("chunk {}: workspace does not match its document", chunk.id);
            }
        }
        if let Some(ref v) = chunk.embedding {
            check_dims(v)?;
        }
        self.chunks.write().unwrap().push(chunk);
        Ok(())
    }

    pub fn insert_entity(&self, entity: Entity) -> Result<()> {
        self.check_provenance(
            &entity.tenant_id,
            &entity.workspace,
            &entity.source_chunk_ids,
        )?;
        if let Some(ref v) = entity.embedding {
            check_dims(v)?;
        }
        self.entities.write().unwrap().push(entity);
        Ok(())
    }

    pub fn insert_relation(&self, relation: Relation) -> Result<()> {
        {
            let entities = self.entities.read().unwrap();
            for endpoint in [&relation.source_entity_id, &relation.target_entity_id] {
                let owned = entities.iter().any(|e| {
                    &e.id == endpoint
                        && e.tenant_id == relation.tenant_id
                        && e.workspace == relation.workspace
                });
                if !owned {
                    bail!(
                        "relation {}: endpoint {} not found in tenant workspace",
                        relation.id,
                        endpoint
                    );
                }
            }
        }
        self.check_provenance(
            &relation.tenant_id,
            &relation.workspace,
            &relation.source_chunk_ids,
        )?;
        if let Some(ref v) = relation.embedding {
            check_dims(v)?;
        }
        self.relations.write().unwrap().push(relation);
        Ok(())
    }

    fn check_provenance(&self, tenant: &str, workspace: &str, chunk_ids: &[String]) -> Result<()> {
        let chunks = self.chunks.read().unwrap();
        for id in chunk_ids {
            let owned = chunks
                .iter()
                .any(|c| &c.id == id && c.tenant_id == tenant && c.workspace == workspace);
            if !owned {
                bail!("provenance chunk {} not found in tenant workspace", id);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Order `rows` by the position of their id in `ids`, dropping duplicates.
fn in_id_order<T: Clone>(rows: &[T], ids: &[String], id_of: impl Fn(&T) -> &str) -> Vec<T> {
    let by_id: HashMap<&str, &T> = rows.iter().map(|r| (id_of(r), r)).collect();
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .filter_map(|id| by_id.get(id.as_str()).map(|r| (*r).clone()))
        .collect()
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn find_similar_chunks(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.chunks.read().unwrap();
        let candidates = chunks
            .iter()
            .filter(|c| c.tenant_id == tenant && c.workspace == workspace)
            .filter_map(|c| c.embedding.clone().map(|v| (c, v)));
        Ok(rank_by_distance(query_vec, candidates, k)
            .into_iter()
            .map(|(c, distance)| ScoredChunk {
                chunk: c.clone(),
                distance,
            })
            .collect())
    }

    async fn get_chunks_by_ids(&self, tenant: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        let owned: Vec<Chunk> = chunks
            .iter()
            .filter(|c| c.tenant_id == tenant)
            .cloned()
            .collect();
        Ok(in_id_order(&owned, ids, |c| c.id.as_str()))
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn find_similar_entities(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredEntity>> {
        let entities = self.entities.read().unwrap();
        let candidates = entities
            .iter()
            .filter(|e| e.tenant_id == tenant && e.workspace == workspace)
            .filter_map(|e| e.embedding.clone().map(|v| (e, v)));
        Ok(rank_by_distance(query_vec, candidates, k)
            .into_iter()
            .map(|(e, distance)| ScoredEntity {
                entity: e.clone(),
                distance,
            })
            .collect())
    }

    async fn find_similar_relations(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredRelation>> {
        let relations = self.relations.read().unwrap();
        let candidates = relations
            .iter()
            .filter(|r| r.tenant_id == tenant && r.workspace == workspace)
            .filter_map(|r| r.embedding.clone().map(|v| (r, v)));
        Ok(rank_by_distance(query_vec, candidates, k)
            .into_iter()
            .map(|(r, distance)| ScoredRelation {
                relation: r.clone(),
                distance,
            })
            .collect())
    }

    async fn get_entities_by_ids(&self, tenant: &str, ids: &[String]) -> Result<Vec<Entity>> {
        let entities = self.entities.read().unwrap();
        let owned: Vec<Entity> = entities
            .iter()
            .filter(|e| e.tenant_id == tenant)
            .cloned()
            .collect();
        Ok(in_id_order(&owned, ids, |e| e.id.as_str()))
    }
}
