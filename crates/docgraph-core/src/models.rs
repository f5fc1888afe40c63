//! Core data models shared by the store, retrieval, and synthesis layers.
//!
//! Documents, chunks, entities, and relations are produced by the ingestion
//! pipeline and only ever read by the retrieval engine. Every persisted row
//! carries the owning tenant so that stores can filter on it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

/// An uploaded document. Retrieval never reads it directly, only via chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    pub workspace: String,
    pub status: DocumentStatus,
}

/// A bounded slice of a document's text, the atomic unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Always equal to the parent document's tenant.
    pub tenant_id: String,
    pub workspace: String,
    /// Position within the parent document.
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    /// `None` when embedding generation failed or has not run yet.
    pub embedding: Option<Vec<f32>>,
}

/// A named node of the knowledge graph extracted from chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub tenant_id: String,
    pub workspace: String,
    pub name: String,
    pub entity_type: String,
    pub description: Option<String>,
    /// Provenance: chunks this entity was derived from.
    pub source_chunk_ids: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

impl Entity {
    /// The text that is embedded for similarity search.
    ///
    /// `"name: description"`, or just the name when there is no description.
    pub fn embedding_text(&self) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => format!("{}: {}", self.name, desc),
            _ => self.name.clone(),
        }
    }
}

/// A typed edge between two entities of the same tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub tenant_id: String,
    pub workspace: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relation_type: String,
    pub description: Option<String>,
    pub source_chunk_ids: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

impl Relation {
    /// The text that is embedded for similarity search: the description,
    /// or `"source relation_type target"` when there is none.
    pub fn embedding_text(&self, source_name: &str, target_name: &str) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => desc.to_string(),
            _ => format!("{} {} {}", source_name, self.relation_type, target_name),
        }
    }
}

/// A chunk paired with its distance to the query vector (lower is closer).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRelation {
    pub relation: Relation,
    pub distance: f32,
}

/// Prompt/completion token counters reported by the completion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A chunk reference returned to the caller as a citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    /// Similarity in `[-1, 1]` for chunks found by vector search; absent for
    /// chunks reached through the knowledge graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// An entity surfaced alongside the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&Entity> for EntityRef {
    fn from(e: &Entity) -> Self {
        Self {
            id: e.id.clone(),
            name: e.name.clone(),
            entity_type: e.entity_type.clone(),
            description: e.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(description: Option<&str>) -> Entity {
        Entity {
            id: "e1".into(),
            tenant_id: "t1".into(),
            workspace: "default".into(),
            name: "Refund Policy".into(),
            entity_type: "policy".into(),
            description: description.map(String::from),
            source_chunk_ids: vec![],
            embedding: None,
        }
    }

    #[test]
    fn embedding_text_uses_description() {
        assert_eq!(
            entity(Some("30 day window")).embedding_text(),
            "Refund Policy: 30 day window"
        );
    }

    #[test]
    fn relation_text_falls_back_to_triple() {
        let rel = Relation {
            id: "r1".into(),
            tenant_id: "t1".into(),
            workspace: "default".into(),
            source_entity_id: "e1".into(),
            target_entity_id: "e2".into(),
            relation_type: "offers".into(),
            description: None,
            source_chunk_ids: vec![],
            embedding: None,
        };
        assert_eq!(
            rel.embedding_text("Acme", "Store Credit"),
            "Acme offers Store Credit"
        );
    }

    #[test]
    fn embedding_text_falls_back_to_name() {
        assert_eq!(entity(None).embedding_text(), "Refund Policy");
        assert_eq!(entity(Some("  ")).embedding_text(), "Refund Policy");
    }

    #[test]
    fn document_status_parses() {
        assert_eq!(
            "processed".parse::<DocumentStatus>().unwrap(),
            DocumentStatus::Processed
        );
        assert!("archived".parse::<DocumentStatus>().is_err());
    }
}
