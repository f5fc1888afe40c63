//! Response synthesis: context assembly and the completion call.
//!
//! [`build_context`] turns retrieved material into a bounded text block;
//! [`Synthesizer`] sends it, with the query, to a [`CompletionService`] and
//! shapes the answer. Nothing here persists state; usage accounting is the
//! caller's job.
//!
//! # Context budget
//!
//! Chunks are admitted in rank order while their `token_count` fits in
//! `max_context_tokens`. The first chunk that does not fit ends the list;
//! chunk text is never cut. The top-ranked chunk is always admitted so a
//! single oversized chunk still yields an answer. Entity and relation lines
//! use whatever budget is left, estimated at four characters per token.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::QueryError;
use crate::models::{EntityRef, SourceRef, TokenUsage};
use crate::retrieval::{RetrievedChunk, RetrievedContext};

/// Returned when retrieval found nothing to ground an answer in.
pub const NO_INFORMATION_ANSWER: &str =
    "I couldn't find any relevant information in your documents to answer this question.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions \
using only the provided context from the user's documents. If the context does not contain \
the answer, say that you don't know. Cite sources by their bracketed number, e.g. [1].";

const CHARS_PER_TOKEN: usize = 4;

/// Input to a completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub context: String,
    pub query: String,
    /// Per-request model override; `None` uses the service default.
    pub model: Option<String>,
}

impl CompletionRequest {
    /// The user turn sent to the model.
    pub fn user_prompt(&self) -> String {
        format!(
            "Context:\n{}\n\nQuestion: {}\n\nAnswer:",
            self.context, self.query
        )
    }
}

/// Output of a completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Absent when the service does not report usage.
    pub usage: Option<TokenUsage>,
}

/// A generative completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub max_context_tokens: usize,
    pub system_prompt: String,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// The assembled context and which chunks made it in.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    pub text: String,
    /// Admitted chunks, in rank order.
    pub chunks: Vec<RetrievedChunk>,
    pub estimated_tokens: usize,
}

/// Build the context block for `retrieved` within `max_tokens`.
pub fn build_context(retrieved: &RetrievedContext, max_tokens: usize) -> ContextBlock {
    let mut used = 0usize;
    let mut admitted: Vec<RetrievedChunk> = Vec::new();

    for (rank, rc) in retrieved.chunks.iter().enumerate() {
        let cost = rc.chunk.token_count.max(0) as usize;
        if rank > 0 && used + cost > max_tokens {
            break;
        }
        used += cost;
        admitted.push(rc.clone());
    }

    let names: HashMap<&str, &str> = retrieved
        .entities
        .iter()
        .map(|e| (e.id.as_str(), e.name.as_str()))
        .collect();

    let mut entity_lines = Vec::new();
    for e in &retrieved.entities {
        let line = match e.description.as_deref() {
            Some(d) if !d.trim().is_empty() => format!("- {} ({}): {}", e.name, e.entity_type, d),
            _ => format!("- {} ({})", e.name, e.entity_type),
        };
        let cost = estimate_tokens(&line);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        entity_lines.push(line);
    }

    let mut relation_lines = Vec::new();
    for r in &retrieved.relations {
        let src = names
            .get(r.source_entity_id.as_str())
            .copied()
            .unwrap_or(&r.source_entity_id);
        let tgt = names
            .get(r.target_entity_id.as_str())
            .copied()
            .unwrap_or(&r.target_entity_id);
        let line = match r.description.as_deref() {
            Some(d) if !d.trim().is_empty() => {
                format!("- {} -[{}]-> {}: {}", src, r.relation_type, tgt, d)
            }
            _ => format!("- {} -[{}]-> {}", src, r.relation_type, tgt),
        };
        let cost = estimate_tokens(&line);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        relation_lines.push(line);
    }

    let mut text = String::new();
    if !entity_lines.is_empty() {
        text.push_str("-----Entities-----\n");
        text.push_str(&entity_lines.join("\n"));
        text.push_str("\n\n");
    }
    if !relation_lines.is_empty() {
        text.push_str("-----Relationships-----\n");
        text.push_str(&relation_lines.join("\n"));
        text.push_str("\n\n");
    }
    text.push_str("-----Sources-----\n");
    for (i, rc) in admitted.iter().enumerate() {
        text.push_str(&format!("[{}] {}\n\n", i + 1, rc.chunk.content.trim()));
    }

    ContextBlock {
        text: text.trim_end().to_string(),
        chunks: admitted,
        estimated_tokens: used,
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// The synthesized answer before the boundary adds `mode_used`.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    pub entities: Vec<EntityRef>,
    pub token_usage: Option<TokenUsage>,
}

/// Builds context and calls the completion service.
pub struct Synthesizer {
    completion: Arc<dyn CompletionService>,
    settings: SynthesisSettings,
}

impl Synthesizer {
    pub fn new(completion: Arc<dyn CompletionService>, settings: SynthesisSettings) -> Self {
        Self {
            completion,
            settings,
        }
    }

    /// Answer `query` from `retrieved`.
    ///
    /// With no retrieved chunks the completion service is not called and
    /// [`NO_INFORMATION_ANSWER`] is returned. Completion failures become
    /// [`QueryError::UpstreamCompletion`].
    pub async fn synthesize(
        &self,
        query: &str,
        retrieved: &RetrievedContext,
        system_prompt: Option<&str>,
        model: Option<&str>,
    ) -> Result<Answer, QueryError> {
        let entities: Vec<EntityRef> = retrieved.entities.iter().map(EntityRef::from).collect();

        if retrieved.is_empty() {
            return Ok(Answer {
                text: NO_INFORMATION_ANSWER.to_string(),
                sources: Vec::new(),
                entities,
                token_usage: None,
            });
        }

        let block = build_context(retrieved, self.settings.max_context_tokens);
        let request = CompletionRequest {
            system_prompt: system_prompt
                .unwrap_or(&self.settings.system_prompt)
                .to_string(),
            context: block.text,
            query: query.to_string(),
            model: model.map(String::from),
        };

        let completion = self
            .completion
            .complete(&request)
            .await
            .map_err(QueryError::completion)?;

        let sources = block
            .chunks
            .iter()
            .map(|rc| SourceRef {
                chunk_id: rc.chunk.id.clone(),
                document_id: rc.chunk.document_id.clone(),
                chunk_index: rc.chunk.chunk_index,
                content: rc.chunk.content.clone(),
                score: rc.similarity,
            })
            .collect();

        Ok(Answer {
            text: completion.text,
            sources,
            entities,
            token_usage: completion.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Entity, Relation};
    use std::sync::Mutex;

    fn rc(id: &str, tokens: i64) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                id: id.into(),
                document_id: "d1".into(),
                tenant_id: "t1".into(),
                workspace: "default".into(),
                chunk_index: 0,
                content: format!("body of {}", id),
                token_count: tokens,
                embedding: None,
            },
            similarity: Some(0.9),
        }
    }

    fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.into(),
            tenant_id: "t1".into(),
            workspace: "default".into(),
            name: name.into(),
            entity_type: "policy".into(),
            description: Some("30 days".into()),
            source_chunk_ids: vec![],
            embedding: None,
        }
    }

    /// Records the last request and replies with a canned completion.
    struct Recorder {
        last: Mutex<Option<CompletionRequest>>,
        usage: Option<TokenUsage>,
        fail: bool,
    }

    impl Recorder {
        fn new(usage: Option<TokenUsage>) -> Self {
            Self {
                last: Mutex::new(None),
                usage,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl CompletionService for Recorder {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            *self.last.lock().unwrap() = Some(request.clone());
            if self.fail {
                anyhow::bail!("completion request timed out");
            }
            Ok(Completion {
                text: "answer".into(),
                usage: self.usage,
            })
        }
    }

    #[test]
    fn budget_truncates_by_rank_not_text() {
        let retrieved = RetrievedContext {
            chunks: vec![rc("a", 60), rc("b", 30), rc("c", 5)],
            ..Default::default()
        };
        let block = build_context(&retrieved, 80);
        let ids: Vec<&str> = block.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(block.text.contains("[1] body of a"));
        assert!(!block.text.contains("body of c"));
    }

    #[test]
    fn oversized_top_chunk_still_admitted() {
        let retrieved = RetrievedContext {
            chunks: vec![rc("big", 10_000), rc("small", 1)],
            ..Default::default()
        };
        let block = build_context(&retrieved, 100);
        assert_eq!(block.chunks.len(), 1);
        assert_eq!(block.chunks[0].chunk.id, "big");
    }

    #[test]
    fn entities_and_relations_rendered_by_name() {
        let retrieved = RetrievedContext {
            chunks: vec![rc("a", 10)],
            entities: vec![entity("e1", "Refund Policy"), entity("e2", "Store Credit")],
            relations: vec![Relation {
                id: "r1".into(),
                tenant_id: "t1".into(),
                workspace: "default".into(),
                source_entity_id: "e1".into(),
                target_entity_id: "e2".into(),
                relation_type: "offers".into(),
                description: None,
                source_chunk_ids: vec![],
                embedding: None,
            }],
        };
        let block = build_context(&retrieved, 4000);
        assert!(block.text.contains("- Refund Policy (policy): 30 days"));
        assert!(block.text.contains("- Refund Policy -[offers]-> Store Credit"));
        assert!(block.text.find("-----Entities-----") < block.text.find("-----Sources-----"));
    }

    #[tokio::test]
    async fn empty_retrieval_answers_without_calling_model() {
        let recorder = Arc::new(Recorder::new(None));
        let synth = Synthesizer::new(recorder.clone(), SynthesisSettings::default());
        let answer = synth
            .synthesize("q", &RetrievedContext::default(), None, None)
            .await
            .unwrap();
        assert_eq!(answer.text, NO_INFORMATION_ANSWER);
        assert!(answer.sources.is_empty());
        assert!(answer.token_usage.is_none());
        assert!(recorder.last.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn overrides_reach_the_service() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        };
        let recorder = Arc::new(Recorder::new(Some(usage)));
        let synth = Synthesizer::new(recorder.clone(), SynthesisSettings::default());
        let retrieved = RetrievedContext {
            chunks: vec![rc("a", 10)],
            ..Default::default()
        };
        let answer = synth
            .synthesize("refunds?", &retrieved, Some("be brief"), Some("m-override"))
            .await
            .unwrap();

        assert_eq!(answer.text, "answer");
        assert_eq!(answer.token_usage, Some(usage));
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].chunk_id, "a");

        let sent = recorder.last.lock().unwrap().clone().unwrap();
        assert_eq!(sent.system_prompt, "be brief");
        assert_eq!(sent.model.as_deref(), Some("m-override"));
        assert!(sent.user_prompt().contains("Question: refunds?"));
    }

    #[tokio::test]
    async fn completion_failure_is_upstream_error() {
        let mut recorder = Recorder::new(None);
        recorder.fail = true;
        let synth = Synthesizer::new(Arc::new(recorder), SynthesisSettings::default());
        let retrieved = RetrievedContext {
            chunks: vec![rc("a", 10)],
            ..Default::default()
        };
        let err = synth
            .synthesize("q", &retrieved, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UpstreamCompletion(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
