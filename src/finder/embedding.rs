use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::tools::ToolSpec;
use crate::utils::canonical::sha256_hex;

use super::{ToolMatch, match_for};

/// Text-embedding collaborator. Implementations wrap whatever embedding
/// back-end the embedder chooses; the finder only needs vectors.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Stable identifier participating in the on-disk vector cache key.
    fn id(&self) -> &str;

    /// One vector per input text, aligned with the input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Description vectors with an on-disk cache keyed by
/// `(model_id, description_hash)`: re-embedding happens only for new or
/// edited descriptions, and never twice across runs.
pub struct EmbeddingIndex {
    model: Arc<dyn EmbeddingModel>,
    cache_dir: Option<PathBuf>,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    loaded: Mutex<bool>,
}

impl EmbeddingIndex {
    pub fn new(model: Arc<dyn EmbeddingModel>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            model,
            cache_dir,
            vectors: Mutex::new(HashMap::new()),
            loaded: Mutex::new(false),
        }
    }

    fn cache_file(&self) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let model_tag = sha256_hex(self.model.id());
        Some(dir.join(format!("embeddings_{}.json", &model_tag[..16])))
    }

    fn load_cache(&self) {
        let mut loaded = self
            .loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *loaded {
            return;
        }
        *loaded = true;
        let Some(path) = self.cache_file() else { return };
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        match serde_json::from_str::<HashMap<String, Vec<f32>>>(&raw) {
            Ok(cached) => {
                debug!("loaded {} cached embeddings from {}", cached.len(), path.display());
                self.vectors
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .extend(cached);
            }
            Err(e) => warn!("ignoring corrupt embedding cache {}: {}", path.display(), e),
        }
    }

    fn persist_cache(&self) {
        let Some(path) = self.cache_file() else { return };
        let snapshot = self
            .vectors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Ok(raw) = serde_json::to_string(&snapshot) else {
            return;
        };
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!("failed to create embedding cache dir: {}", e);
            return;
        }
        if let Err(e) = std::fs::write(&path, raw) {
            warn!("failed to persist embedding cache to {}: {}", path.display(), e);
        }
    }

    /// Rank specs by cosine similarity between the query vector and each
    /// description vector, embedding uncached descriptions on demand.
    pub async fn search(
        &self,
        specs: &[Arc<ToolSpec>],
        query: &str,
        limit: usize,
    ) -> Result<Vec<ToolMatch>> {
        self.load_cache();

        let texts: Vec<String> = specs.iter().map(|s| description_text(s)).collect();
        let hashes: Vec<String> = texts.iter().map(|t| sha256_hex(t)).collect();

        let missing: Vec<(usize, String)> = {
            let vectors = self
                .vectors
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            hashes
                .iter()
                .enumerate()
                .filter(|(_, hash)| !vectors.contains_key(*hash))
                .map(|(i, _)| (i, texts[i].clone()))
                .collect()
        };
        if !missing.is_empty() {
            debug!("embedding {} uncached tool descriptions", missing.len());
            let inputs: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let embedded = self
                .model
                .embed(&inputs)
                .await
                .context("description embedding failed")?;
            anyhow::ensure!(
                embedded.len() == missing.len(),
                "embedding model returned {} vectors for {} inputs",
                embedded.len(),
                missing.len()
            );
            let mut vectors = self
                .vectors
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for ((index, _), vector) in missing.iter().zip(embedded) {
                vectors.insert(hashes[*index].clone(), vector);
            }
            drop(vectors);
            self.persist_cache();
        }

        let query_vector = self
            .model
            .embed(std::slice::from_ref(&query.to_string()))
            .await
            .context("query embedding failed")?
            .into_iter()
            .next()
            .context("embedding model returned no query vector")?;

        let vectors = self
            .vectors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut scored: Vec<(f32, &Arc<ToolSpec>)> = specs
            .iter()
            .zip(&hashes)
            .filter_map(|(spec, hash)| {
                let vector = vectors.get(hash)?;
                Some((cosine_similarity(&query_vector, vector), spec))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, spec)| match_for(spec, Some(score)))
            .collect())
    }
}

fn description_text(spec: &ToolSpec) -> String {
    if spec.description.is_empty() {
        spec.name.clone()
    } else {
        format!("{}: {}", spec.name, spec.description)
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
