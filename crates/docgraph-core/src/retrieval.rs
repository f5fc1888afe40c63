//! Retrieval engine implementing the five retrieval modes.
//!
//! The engine works entirely through the [`ChunkStore`], [`GraphStore`], and
//! [`Embedder`] traits; the application constructs the concrete clients once
//! and injects them.
//!
//! # Modes
//!
//! | Mode | Steps |
//! |------|-------|
//! | `naive` | vector search over chunks |
//! | `local` | vector search over entities → provenance chunks |
//! | `global` | vector search over relations → endpoint entities → provenance chunks |
//! | `hybrid` | `local` ∪ `global` |
//! | `mix` | `naive` ∪ `local` ∪ `global` |
//!
//! The query is embedded once and the vector is shared by every strategy.
//! Unions are evaluated naive → local → global; the first occurrence of a
//! chunk wins and the result is capped at `top_k`, so naive hits survive
//! truncation first.
//!
//! Every row must belong to the requesting tenant and workspace. Provenance
//! lookups go by id, so rows from another workspace are dropped from each
//! strategy's contribution before the union is capped.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;

use crate::embedding::{Embedder, EMBEDDING_DIMS};
use crate::error::{EmbeddingFailed, QueryError};
use crate::mode::RetrievalMode;
use crate::models::{Chunk, Entity, Relation};
use crate::store::{ChunkStore, GraphStore};

/// Tuning knobs, decoupled from application config.
#[derive(Debug, Clone, Default)]
pub struct RetrievalParams {
    /// Entities to match in `local`; defaults to the request's `top_k`.
    pub entity_top_k: Option<usize>,
    /// Relations to match in `global`; defaults to the request's `top_k`.
    pub relation_top_k: Option<usize>,
}

/// A chunk selected for the context, in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Cosine similarity for chunks found by direct vector search.
    pub similarity: Option<f32>,
}

/// Everything retrieval produced for one query.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub chunks: Vec<RetrievedChunk>,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Insertion-ordered set keyed by id. The first item pushed for a key wins.
#[derive(Debug)]
pub struct OrderedUnion<T> {
    seen: HashSet<String>,
    items: Vec<T>,
}

impl<T> OrderedUnion<T> {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    /// Add `item` unless `key` was already seen. Returns whether it was added.
    pub fn push(&mut self, key: &str, item: T) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        self.items.push(item);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    pub fn into_capped(mut self, cap: usize) -> Vec<T> {
        self.items.truncate(cap);
        self.items
    }
}

impl<T> Default for OrderedUnion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What one strategy contributed before merging.
#[derive(Debug, Default)]
struct Contribution {
    chunks: Vec<RetrievedChunk>,
    entities: Vec<Entity>,
    relations: Vec<Relation>,
}

/// Orchestrates embedding and store lookups for a query.
pub struct RetrievalEngine {
    chunks: Arc<dyn ChunkStore>,
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    params: RetrievalParams,
}

impl RetrievalEngine {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            chunks,
            graph,
            embedder,
            params,
        }
    }

    /// Run `mode` for `tenant` within `workspace`, returning at most `top_k`
    /// chunks.
    ///
    /// An empty knowledge graph yields an empty contribution, not an error.
    /// Embedding and store failures abort the whole retrieval; nothing is
    /// synthesized from a partial result.
    pub async fn retrieve(
        &self,
        tenant: &str,
        workspace: &str,
        query: &str,
        mode: RetrievalMode,
        top_k: usize,
    ) -> Result<RetrievedContext, QueryError> {
        let query_vec = self.embedder.embed(query).await?;
        if query_vec.len() != EMBEDDING_DIMS {
            return Err(EmbeddingFailed {
                attempts: 1,
                message: format!(
                    "query embedding has {} dimensions, expected {}",
                    query_vec.len(),
                    EMBEDDING_DIMS
                ),
            }
            .into());
        }

        let mut parts: Vec<Contribution> = Vec::with_capacity(3);
        if matches!(mode, RetrievalMode::Naive | RetrievalMode::Mix) {
            parts.push(self.naive(tenant, workspace, &query_vec, top_k).await?);
        }
        if matches!(
            mode,
            RetrievalMode::Local | RetrievalMode::Hybrid | RetrievalMode::Mix
        ) {
            parts.push(self.local(tenant, workspace, &query_vec, top_k).await?);
        }
        if matches!(
            mode,
            RetrievalMode::Global | RetrievalMode::Hybrid | RetrievalMode::Mix
        ) {
            parts.push(self.global(tenant, workspace, &query_vec, top_k).await?);
        }

        for part in &mut parts {
            enforce_scope(tenant, workspace, part);
        }
        let ctx = merge(parts, top_k);

        tracing::debug!(
            tenant,
            workspace,
            mode = %mode,
            chunks = ctx.chunks.len(),
            entities = ctx.entities.len(),
            relations = ctx.relations.len(),
            "retrieval complete"
        );

        Ok(ctx)
    }

    async fn naive(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Contribution, QueryError> {
        let hits = self
            .chunks
            .find_similar_chunks(tenant, workspace, query_vec, top_k)
            .await
            .context("find_similar_chunks")
            .map_err(QueryError::store)?;

        Ok(Contribution {
            chunks: hits
                .into_iter()
                .map(|h| RetrievedChunk {
                    chunk: h.chunk,
                    similarity: Some(1.0 - h.distance),
                })
                .collect(),
            ..Default::default()
        })
    }

    async fn local(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Contribution, QueryError> {
        let k = self.params.entity_top_k.unwrap_or(top_k);
        let matched = self
            .graph
            .find_similar_entities(tenant, workspace, query_vec, k)
            .await
            .context("find_similar_entities")
            .map_err(QueryError::store)?;

        if matched.is_empty() {
            return Ok(Contribution::default());
        }

        let entities: Vec<Entity> = matched
            .into_iter()
            .map(|m| m.entity)
            .filter(|e| e.workspace == workspace)
            .collect();
        let chunk_ids = provenance_ids(entities.iter().map(|e| e.source_chunk_ids.as_slice()));
        let chunks = self.fetch_chunks(tenant, workspace, &chunk_ids).await?;

        Ok(Contribution {
            chunks,
            entities,
            relations: Vec::new(),
        })
    }

    async fn global(
        &self,
        tenant: &str,
        workspace: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Contribution, QueryError> {
        let k = self.params.relation_top_k.unwrap_or(top_k);
        let matched = self
            .graph
            .find_similar_relations(tenant, workspace, query_vec, k)
            .await
            .context("find_similar_relations")
            .map_err(QueryError::store)?;

        if matched.is_empty() {
            return Ok(Contribution::default());
        }

        let relations: Vec<Relation> = matched
            .into_iter()
            .map(|m| m.relation)
            .filter(|r| r.workspace == workspace)
            .collect();

        let mut endpoint_ids = OrderedUnion::new();
        for r in &relations {
            endpoint_ids.push(&r.source_entity_id, r.source_entity_id.clone());
            endpoint_ids.push(&r.target_entity_id, r.target_entity_id.clone());
        }
        let mut entities = self
            .graph
            .get_entities_by_ids(tenant, &endpoint_ids.into_vec())
            .await
            .context("get_entities_by_ids")
            .map_err(QueryError::store)?;
        entities.retain(|e| e.workspace == workspace);

        let chunk_ids = provenance_ids(
            relations
                .iter()
                .map(|r| r.source_chunk_ids.as_slice())
                .chain(entities.iter().map(|e| e.source_chunk_ids.as_slice())),
        );
        let chunks = self.fetch_chunks(tenant, workspace, &chunk_ids).await?;

        Ok(Contribution {
            chunks,
            entities,
            relations,
        })
    }

    /// Provenance chunks by id, restricted to `workspace`.
    async fn fetch_chunks(
        &self,
        tenant: &str,
        workspace: &str,
        ids: &[String],
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self
            .chunks
            .get_chunks_by_ids(tenant, ids)
            .await
            .context("get_chunks_by_ids")
            .map_err(QueryError::store)?;
        Ok(chunks
            .into_iter()
            .filter(|c| {
                let keep = c.workspace == workspace;
                if !keep {
                    tracing::debug!(
                        tenant,
                        workspace,
                        chunk = %c.id,
                        "skipping provenance chunk from another workspace"
                    );
                }
                keep
            })
            .map(|chunk| RetrievedChunk {
                chunk,
                similarity: None,
            })
            .collect())
    }
}

/// Flatten provenance lists into a deduplicated, first-seen-ordered id list.
fn provenance_ids<'a>(lists: impl Iterator<Item = &'a [String]>) -> Vec<String> {
    let mut ids = OrderedUnion::new();
    for list in lists {
        for id in list {
            ids.push(id, id.clone());
        }
    }
    ids.into_vec()
}

/// Union contributions in order, first occurrence wins, chunks capped at `top_k`.
fn merge(parts: Vec<Contribution>, top_k: usize) -> RetrievedContext {
    let mut chunks = OrderedUnion::new();
    let mut entities = OrderedUnion::new();
    let mut relations = OrderedUnion::new();

    for part in parts {
        for c in part.chunks {
            let id = c.chunk.id.clone();
            chunks.push(&id, c);
        }
        for e in part.entities {
            let id = e.id.clone();
            entities.push(&id, e);
        }
        for r in part.relations {
            let id = r.id.clone();
            relations.push(&id, r);
        }
    }

    RetrievedContext {
        chunks: chunks.into_capped(top_k),
        entities: entities.into_vec(),
        relations: relations.into_vec(),
    }
}

/// Drop anything outside `tenant` and `workspace`. Runs on each strategy's
/// contribution so out-of-scope rows never take a slot under `top_k`.
fn enforce_scope(tenant: &str, workspace: &str, part: &mut Contribution) {
    let before = part.chunks.len() + part.entities.len() + part.relations.len();
    part.chunks.retain(|c| c.chunk.tenant_id == tenant);
    part.entities.retain(|e| e.tenant_id == tenant);
    part.relations.retain(|r| r.tenant_id == tenant);
    let owned = part.chunks.len() + part.entities.len() + part.relations.len();
    if owned < before {
        // Stores already filter by tenant; a hit here is a backend bug.
        tracing::error!(
            tenant,
            dropped = before - owned,
            "store returned rows owned by another tenant"
        );
    }

    part.chunks.retain(|c| c.chunk.workspace == workspace);
    part.entities.retain(|e| e.workspace == workspace);
    part.relations.retain(|r| r.workspace == workspace);
    let scoped = part.chunks.len() + part.entities.len() + part.relations.len();
    if scoped < owned {
        tracing::warn!(
            tenant,
            workspace,
            dropped = owned - scoped,
            "dropped rows from another workspace"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, DocumentStatus, ScoredChunk, ScoredEntity, ScoredRelation};
    use crate::store::memory::InMemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIMS];
        v[i] = 1.0;
        v
    }

    /// Embeds every query to a fixed vector.
    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingFailed> {
            Ok(self.0.clone())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingFailed> {
            Err(EmbeddingFailed {
                attempts: 3,
                message: "unavailable".into(),
            })
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            for (doc, tenant) in [("d1", "t1"), ("d2", "t2")] {
                store
                    .insert_document(Document {
                        id: doc.into(),
                        tenant_id: tenant.into(),
                        workspace: "default".into(),
                        status: DocumentStatus::Processed,
                    })
                    .unwrap();
            }
            Self { store }
        }

        fn chunk(&self, id: &str, tenant: &str, embedding: Option<Vec<f32>>) {
            let doc = if tenant == "t1" { "d1" } else { "d2" };
            self.store
                .insert_chunk(Chunk {
                    id: id.into(),
                    document_id: doc.into(),
                    tenant_id: tenant.into(),
                    workspace: "default".into(),
                    chunk_index: 0,
                    content: format!("text {}", id),
                    token_count: 10,
                    embedding,
                })
                .unwrap();
        }

        fn entity(&self, id: &str, tenant: &str, chunks: &[&str], embedding: Vec<f32>) {
            self.store
                .insert_entity(Entity {
                    id: id.into(),
                    tenant_id: tenant.into(),
                    workspace: "default".into(),
                    name: id.to_uppercase(),
                    entity_type: "concept".into(),
                    description: Some(format!("about {}", id)),
                    source_chunk_ids: chunks.iter().map(|s| s.to_string()).collect(),
                    embedding: Some(embedding),
                })
                .unwrap();
        }

        fn relation(&self, id: &str, tenant: &str, ends: (&str, &str), chunks: &[&str], v: Vec<f32>) {
            self.store
                .insert_relation(Relation {
                    id: id.into(),
                    tenant_id: tenant.into(),
                    workspace: "default".into(),
                    source_entity_id: ends.0.into(),
                    target_entity_id: ends.1.into(),
                    relation_type: "related_to".into(),
                    description: Some(format!("{} relates", id)),
                    source_chunk_ids: chunks.iter().map(|s| s.to_string()).collect(),
                    embedding: Some(v),
                })
                .unwrap();
        }

        fn engine(&self, embedder: Arc<dyn Embedder>) -> RetrievalEngine {
            RetrievalEngine::new(
                self.store.clone(),
                self.store.clone(),
                embedder,
                RetrievalParams::default(),
            )
        }
    }

    fn ids(ctx: &RetrievedContext) -> Vec<&str> {
        ctx.chunks.iter().map(|c| c.chunk.id.as_str()).collect()
    }

    #[test]
    fn ordered_union_first_wins() {
        let mut u = OrderedUnion::new();
        assert!(u.push("a", 1));
        assert!(u.push("b", 2));
        assert!(!u.push("a", 3));
        assert_eq!(u.len(), 2);
        assert_eq!(u.into_capped(1), vec![1]);
    }

    #[tokio::test]
    async fn naive_ranks_matching_chunk_first() {
        let f = Fixture::new();
        f.chunk("shipping", "t1", Some(axis(1)));
        f.chunk("refunds", "t1", Some(axis(0)));
        f.chunk("about", "t1", Some(axis(2)));

        let engine = f.engine(Arc::new(FixedEmbedder(axis(0))));
        let ctx = engine
            .retrieve("t1", "default", "What is the refund policy?", RetrievalMode::Naive, 10)
            .await
            .unwrap();

        assert_eq!(ids(&ctx)[0], "refunds");
        assert_eq!(ctx.chunks.len(), 3);
        assert!((ctx.chunks[0].similarity.unwrap() - 1.0).abs() < 1e-6);
        assert!(ctx.entities.is_empty());
    }

    #[tokio::test]
    async fn local_follows_entity_provenance() {
        let f = Fixture::new();
        f.chunk("a", "t1", None);
        f.chunk("b", "t1", None);
        f.entity("refund", "t1", &["b", "a"], axis(0));

        let engine = f.engine(Arc::new(FixedEmbedder(axis(0))));
        let ctx = engine
            .retrieve("t1", "default", "refund", RetrievalMode::Local, 10)
            .await
            .unwrap();

        assert_eq!(ids(&ctx), vec!["b", "a"]);
        assert_eq!(ctx.entities.len(), 1);
        assert!(ctx.chunks.iter().all(|c| c.similarity.is_none()));
    }

    #[tokio::test]
    async fn global_collects_relation_and_endpoint_provenance() {
        let f = Fixture::new();
        f.chunk("a", "t1", None);
        f.chunk("b", "t1", None);
        f.chunk("c", "t1", None);
        f.entity("x", "t1", &["b"], axis(5));
        f.entity("y", "t1", &["c"], axis(6));
        f.relation("r", "t1", ("x", "y"), &["a"], axis(0));

        let engine = f.engine(Arc::new(FixedEmbedder(axis(0))));
        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Global, 10)
            .await
            .unwrap();

        assert_eq!(ids(&ctx), vec!["a", "b", "c"]);
        let names: Vec<&str> = ctx.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(ctx.relations.len(), 1);
    }

    #[tokio::test]
    async fn global_without_relations_is_empty_not_error() {
        let f = Fixture::new();
        f.chunk("a", "t1", Some(axis(0)));

        let engine = f.engine(Arc::new(FixedEmbedder(axis(0))));
        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Global, 10)
            .await
            .unwrap();
        assert!(ctx.is_empty());
        assert!(ctx.relations.is_empty());
    }

    #[tokio::test]
    async fn mix_unions_in_first_seen_order() {
        let f = Fixture::new();
        f.chunk("A", "t1", Some(axis(0)));
        f.chunk("B", "t1", None);
        f.chunk("C", "t1", None);
        f.entity("e1", "t1", &["A", "B"], axis(0));
        f.entity("e2", "t1", &[], axis(7));
        f.entity("e3", "t1", &[], axis(8));
        f.relation("r1", "t1", ("e2", "e3"), &["C"], axis(0));

        let engine = f.engine(Arc::new(FixedEmbedder(axis(0))));
        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Mix, 1)
            .await
            .unwrap();
        assert_eq!(ids(&ctx), vec!["A"]);

        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Mix, 10)
            .await
            .unwrap();
        assert_eq!(ids(&ctx), vec!["A", "B", "C"]);
        assert_eq!(ctx.relations.len(), 1);
        assert!(ctx.chunks[0].similarity.is_some());
    }

    #[tokio::test]
    async fn hybrid_dedups_local_and_global() {
        let f = Fixture::new();
        f.chunk("a", "t1", None);
        f.chunk("b", "t1", None);
        f.entity("e1", "t1", &["a"], axis(0));
        f.entity("e2", "t1", &["b"], axis(9));
        f.relation("r1", "t1", ("e1", "e2"), &["a"], axis(0));

        let engine = RetrievalEngine::new(
            f.store.clone(),
            f.store.clone(),
            Arc::new(FixedEmbedder(axis(0))),
            RetrievalParams {
                entity_top_k: Some(1),
                relation_top_k: Some(1),
            },
        );
        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Hybrid, 10)
            .await
            .unwrap();
        assert_eq!(ids(&ctx), vec!["a", "b"]);
        let ents: Vec<&str> = ctx.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ents, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn no_mode_leaks_other_tenants() {
        let f = Fixture::new();
        f.chunk("mine", "t1", Some(axis(1)));
        f.chunk("theirs", "t2", Some(axis(0)));
        f.entity("their_entity", "t2", &["theirs"], axis(0));
        f.entity("their_other", "t2", &[], axis(3));
        f.relation("their_rel", "t2", ("their_entity", "their_other"), &["theirs"], axis(0));

        let engine = f.engine(Arc::new(FixedEmbedder(axis(0))));
        for mode in RetrievalMode::ALL {
            let ctx = engine.retrieve("t1", "default", "q", mode, 50).await.unwrap();
            assert!(ctx.chunks.iter().all(|c| c.chunk.tenant_id == "t1"), "{}", mode);
            assert!(ctx.entities.is_empty(), "{}", mode);
            assert!(ctx.relations.is_empty(), "{}", mode);
        }
    }

    /// A broken backend that returns its rows regardless of tenant,
    /// workspace, or requested ids.
    #[derive(Default)]
    struct ScriptedStore {
        similar: Vec<Chunk>,
        by_id: Vec<Chunk>,
        entities: Vec<Entity>,
    }

    #[async_trait]
    impl ChunkStore for ScriptedStore {
        async fn find_similar_chunks(
            &self,
            _: &str,
            _: &str,
            _: &[f32],
            _: usize,
        ) -> Result<Vec<ScoredChunk>> {
            Ok(self
                .similar
                .iter()
                .map(|c| ScoredChunk {
                    chunk: c.clone(),
                    distance: 0.0,
                })
                .collect())
        }
        async fn get_chunks_by_ids(&self, _: &str, _: &[String]) -> Result<Vec<Chunk>> {
            Ok(self.by_id.clone())
        }
    }

    #[async_trait]
    impl GraphStore for ScriptedStore {
        async fn find_similar_entities(
            &self,
            _: &str,
            _: &str,
            _: &[f32],
            _: usize,
        ) -> Result<Vec<ScoredEntity>> {
            Ok(self
                .entities
                .iter()
                .map(|e| ScoredEntity {
                    entity: e.clone(),
                    distance: 0.0,
                })
                .collect())
        }
        async fn find_similar_relations(
            &self,
            _: &str,
            _: &str,
            _: &[f32],
            _: usize,
        ) -> Result<Vec<ScoredRelation>> {
            Ok(vec![])
        }
        async fn get_entities_by_ids(&self, _: &str, _: &[String]) -> Result<Vec<Entity>> {
            Ok(self.entities.clone())
        }
    }

    fn scripted_chunk(id: &str, tenant: &str, workspace: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: "d".into(),
            tenant_id: tenant.into(),
            workspace: workspace.into(),
            chunk_index: 0,
            content: format!("text {}", id),
            token_count: 1,
            embedding: Some(axis(0)),
        }
    }

    fn scripted_engine(store: ScriptedStore) -> RetrievalEngine {
        let store = Arc::new(store);
        RetrievalEngine::new(
            store.clone(),
            store,
            Arc::new(FixedEmbedder(axis(0))),
            RetrievalParams::default(),
        )
    }

    #[tokio::test]
    async fn leaked_rows_from_other_tenants_are_dropped() {
        let engine = scripted_engine(ScriptedStore {
            similar: vec![scripted_chunk("x", "t2", "default")],
            ..Default::default()
        });
        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Naive, 10)
            .await
            .unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn leaked_rows_do_not_take_top_k_slots() {
        let engine = scripted_engine(ScriptedStore {
            similar: vec![
                scripted_chunk("foreign", "t2", "default"),
                scripted_chunk("elsewhere", "t1", "private"),
                scripted_chunk("own", "t1", "default"),
            ],
            ..Default::default()
        });
        let ctx = engine
            .retrieve("t1", "default", "q", RetrievalMode::Naive, 1)
            .await
            .unwrap();
        assert_eq!(ids(&ctx), vec!["own"]);
    }

    #[tokio::test]
    async fn local_skips_provenance_from_another_workspace() {
        let entity = Entity {
            id: "refund".into(),
            tenant_id: "t1".into(),
            workspace: "default".into(),
            name: "REFUND".into(),
            entity_type: "concept".into(),
            description: None,
            source_chunk_ids: vec!["secret".into(), "public".into()],
            embedding: Some(axis(0)),
        };
        let engine = scripted_engine(ScriptedStore {
            by_id: vec![
                scripted_chunk("secret", "t1", "private"),
                scripted_chunk("public", "t1", "default"),
            ],
            entities: vec![entity],
            ..Default::default()
        });

        for mode in [RetrievalMode::Local, RetrievalMode::Hybrid] {
            let ctx = engine.retrieve("t1", "default", "q", mode, 10).await.unwrap();
            assert_eq!(ids(&ctx), vec!["public"], "{}", mode);
            assert_eq!(ctx.entities.len(), 1, "{}", mode);
        }

        let ctx = engine
            .retrieve("t1", "private", "q", RetrievalMode::Local, 10)
            .await
            .unwrap();
        assert!(ctx.is_empty());
        assert!(ctx.entities.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_aborts() {
        let f = Fixture::new();
        let engine = f.engine(Arc::new(FailingEmbedder));
        let err = engine
            .retrieve("t1", "default", "q", RetrievalMode::Mix, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn wrong_dimension_query_vector_is_embedding_failure() {
        let f = Fixture::new();
        let engine = f.engine(Arc::new(FixedEmbedder(vec![1.0, 0.0])));
        let err = engine
            .retrieve("t1", "default", "q", RetrievalMode::Naive, 10)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "embedding_failed");
    }
}
