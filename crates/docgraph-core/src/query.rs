//! Typed request and result shapes for `execute_query`.
//!
//! [`QueryRequest::validate`] is run once at the boundary; everything past
//! it works with a [`ValidatedQuery`] and never re-checks input.

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::models::{EntityRef, SourceRef, TokenUsage};

pub const DEFAULT_WORKSPACE: &str = "default";
pub const DEFAULT_TOP_K: usize = 10;
pub const MAX_TOP_K: usize = 50;

/// Incoming query, as sent by the web tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn with_top_k(mut self, top_k: i64) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    /// Check the request against the built-in limits.
    pub fn validate(&self) -> Result<ValidatedQuery, QueryError> {
        self.validate_with(DEFAULT_TOP_K, MAX_TOP_K)
    }

    /// Check the request and fill in defaults.
    ///
    /// The mode string is passed through untouched; the mode resolver owns
    /// its interpretation.
    pub fn validate_with(
        &self,
        default_top_k: usize,
        max_top_k: usize,
    ) -> Result<ValidatedQuery, QueryError> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(QueryError::validation("query must not be empty"));
        }

        let top_k = match self.top_k {
            None => default_top_k,
            Some(k) if (1..=max_top_k as i64).contains(&k) => k as usize,
            Some(k) => {
                return Err(QueryError::validation(format!(
                    "top_k must be between 1 and {}, got {}",
                    max_top_k, k
                )))
            }
        };

        let workspace = match self.workspace.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_WORKSPACE.to_string(),
            Some(w) => w.to_string(),
        };

        Ok(ValidatedQuery {
            query: query.to_string(),
            mode: self.mode.clone(),
            workspace,
            top_k,
            system_prompt: self.system_prompt.clone().filter(|s| !s.trim().is_empty()),
            model: self.model.clone().filter(|s| !s.trim().is_empty()),
        })
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub query: String,
    pub mode: Option<String>,
    pub workspace: String,
    pub top_k: usize,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
}

/// The answer returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub entities: Vec<EntityRef>,
    /// Effective mode after entitlement resolution.
    pub mode_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let v = QueryRequest::new("What is the refund policy?").validate().unwrap();
        assert_eq!(v.workspace, "default");
        assert_eq!(v.top_k, 10);
        assert_eq!(v.mode, None);
    }

    #[test]
    fn empty_query_rejected() {
        let err = QueryRequest::new("   ").validate().unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));
    }

    #[test]
    fn top_k_bounds() {
        assert!(QueryRequest::new("q").with_top_k(0).validate().is_err());
        assert!(QueryRequest::new("q").with_top_k(51).validate().is_err());
        assert_eq!(QueryRequest::new("q").with_top_k(1).validate().unwrap().top_k, 1);
        assert_eq!(QueryRequest::new("q").with_top_k(50).validate().unwrap().top_k, 50);
    }

    #[test]
    fn configured_limits_apply() {
        let v = QueryRequest::new("q").validate_with(5, 20).unwrap();
        assert_eq!(v.top_k, 5);
        assert!(QueryRequest::new("q").with_top_k(21).validate_with(5, 20).is_err());
    }

    #[test]
    fn blank_overrides_are_dropped() {
        let mut req = QueryRequest::new("q").with_workspace(" ");
        req.system_prompt = Some("".into());
        req.model = Some("gemini-2.0-flash".into());
        let v = req.validate().unwrap();
        assert_eq!(v.workspace, "default");
        assert_eq!(v.system_prompt, None);
        assert_eq!(v.model.as_deref(), Some("gemini-2.0-flash"));
    }

    #[test]
    fn deserializes_wire_shape() {
        let req: QueryRequest =
            serde_json::from_str(r#"{"query":"hi","mode":"mix","top_k":5}"#).unwrap();
        assert_eq!(req.mode.as_deref(), Some("mix"));
        assert_eq!(req.top_k, Some(5));
        assert_eq!(req.workspace, None);
    }
}
