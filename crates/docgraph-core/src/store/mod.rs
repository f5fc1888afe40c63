//! Storage abstraction for the retrieval engine.
//!
//! [`ChunkStore`] and [`GraphStore`] define the read operations the engine
//! needs, enabling pluggable backends (SQLite in the app crate, in-memory
//! here for tests).
//!
//! # Tenant isolation
//!
//! Every method takes the requesting tenant and must only return rows owned
//! by it. This is a correctness requirement, not a filter hint.
//!
//! # Ranking
//!
//! Similarity methods rank by cosine distance, ascending. Rows at equal
//! distance come back oldest first. Rows without an embedding are never
//! candidates.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Entity, ScoredChunk, ScoredEntity, ScoredRelation};

/// Read access to document chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// The `k` chunks of `tenant`/`workspace` closest to `query_vec`.
    async fn find_similar_chunks(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Chunks by id, in the order of `ids`. Unknown ids and ids owned by
    /// another tenant are skipped.
    async fn get_chunks_by_ids(&self, tenant: &str, ids: &[String]) -> Result<Vec<Chunk>>;
}

/// Read access to the extracted knowledge graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn find_similar_entities(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredEntity>>;

    async fn find_similar_relations(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredRelation>>;

    /// Entities by id, in the order of `ids`, restricted to `tenant`.
    async fn get_entities_by_ids(&self, tenant: &str, ids: &[String]) -> Result<Vec<Entity>>;
}
