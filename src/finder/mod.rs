use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::engine::RemoteModel;
use crate::errors::{DispatchResult, ValidationError};
use crate::registry::ToolRegistry;
use crate::tools::ToolSpec;

pub mod embedding;
pub mod keyword;
pub mod llm;

pub use embedding::{EmbeddingIndex, EmbeddingModel};

/// One discovery result, ranked best-first.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMatch {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Discovery strategy. `Auto` picks the first available of LLM →
/// embedding → keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMethod {
    #[default]
    Auto,
    Keyword,
    Embedding,
    Llm,
}

impl SearchMethod {
    /// Parse a request-time method name. `None` means the name is
    /// unknown; callers fall back to keyword and log.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "keyword" => Some(Self::Keyword),
            "embedding" => Some(Self::Embedding),
            "llm" => Some(Self::Llm),
            _ => None,
        }
    }
}

/// Free-text tool discovery over the registry's names and descriptions.
pub struct ToolFinder {
    registry: Arc<ToolRegistry>,
    embeddings: Option<EmbeddingIndex>,
    model: Option<Arc<dyn RemoteModel>>,
}

impl ToolFinder {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            embeddings: None,
            model: None,
        }
    }

    /// Enable the embedding strategy, caching description vectors under
    /// `cache_dir` (keyed by model id and description hash).
    pub fn with_embedding_model(
        mut self,
        model: Arc<dyn EmbeddingModel>,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        self.embeddings = Some(EmbeddingIndex::new(model, cache_dir));
        self
    }

    /// Enable the LLM strategy backed by a remote model.
    pub fn with_remote_model(mut self, model: Arc<dyn RemoteModel>) -> Self {
        self.model = Some(model);
        self
    }

    fn resolve(&self, method: SearchMethod) -> SearchMethod {
        match method {
            SearchMethod::Auto => {
                if self.model.is_some() {
                    SearchMethod::Llm
                } else if self.embeddings.is_some() {
                    SearchMethod::Embedding
                } else {
                    SearchMethod::Keyword
                }
            }
            explicit => explicit,
        }
    }

    /// Search tool names and descriptions, returning at most `limit`
    /// matches ranked best-first. An empty query is a validation error;
    /// unavailable or failing strategies fall back to keyword with a log.
    pub async fn find(
        &self,
        query: &str,
        method: SearchMethod,
        limit: usize,
    ) -> DispatchResult<Vec<ToolMatch>> {
        if query.trim().is_empty() {
            return Err(ValidationError::new(
                "query",
                "non-empty string",
                "empty",
                vec!["Provide a free-text description of the capability you need".to_string()],
            )
            .into());
        }
        let limit = limit.max(1);
        let specs = self.registry.list_specs();

        match self.resolve(method) {
            SearchMethod::Keyword | SearchMethod::Auto => {
                Ok(keyword::search(&specs, query, limit))
            }
            SearchMethod::Embedding => {
                let Some(index) = &self.embeddings else {
                    warn!("embedding search unavailable; falling back to keyword");
                    return Ok(keyword::search(&specs, query, limit));
                };
                match index.search(&specs, query, limit).await {
                    Ok(matches) => Ok(matches),
                    Err(e) => {
                        warn!("embedding search failed ({}); falling back to keyword", e);
                        Ok(keyword::search(&specs, query, limit))
                    }
                }
            }
            SearchMethod::Llm => {
                let Some(model) = &self.model else {
                    warn!("LLM search unavailable; falling back to keyword");
                    return Ok(keyword::search(&specs, query, limit));
                };
                match llm::search(model.as_ref(), &specs, query, limit).await {
                    Ok(matches) => Ok(matches),
                    Err(e) => {
                        warn!("LLM search failed ({}); falling back to keyword", e);
                        Ok(keyword::search(&specs, query, limit))
                    }
                }
            }
        }
    }
}

pub(crate) fn match_for(spec: &ToolSpec, score: Option<f32>) -> ToolMatch {
    ToolMatch {
        name: spec.name.clone(),
        description: spec.description.clone(),
        score,
    }
}

#[cfg(test)]
mod tests;
