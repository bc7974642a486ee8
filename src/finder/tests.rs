use super::*;
use crate::engine::SamplingParams;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

fn registry_with_tools() -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    let tools = [
        ("UniProt_get_entry", "Fetch a protein entry by accession from UniProt."),
        ("ChEMBL_search_molecules", "Search small molecules by name or structure."),
        ("PubMed_search", "Search biomedical literature abstracts."),
        ("weather_lookup", "Current weather for a city."),
    ];
    for (name, description) in tools {
        let mut spec = ToolSpec::new(name, "Rest");
        spec.description = description.to_string();
        registry.register_tool(spec).unwrap();
    }
    registry
}

#[tokio::test]
async fn empty_query_is_a_validation_error() {
    let finder = ToolFinder::new(registry_with_tools());
    let err = finder.find("  ", SearchMethod::Keyword, 5).await.unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
}

#[tokio::test]
async fn keyword_search_ranks_by_match_count() {
    let finder = ToolFinder::new(registry_with_tools());
    let matches = finder
        .find("protein entry", SearchMethod::Keyword, 5)
        .await
        .unwrap();
    assert!(!matches.is_empty());
    assert_eq!(matches[0].name, "UniProt_get_entry");
}

#[tokio::test]
async fn keyword_search_is_case_insensitive() {
    let finder = ToolFinder::new(registry_with_tools());
    let matches = finder
        .find("WEATHER", SearchMethod::Keyword, 5)
        .await
        .unwrap();
    assert_eq!(matches[0].name, "weather_lookup");
}

#[tokio::test]
async fn keyword_search_respects_limit() {
    let finder = ToolFinder::new(registry_with_tools());
    let matches = finder
        .find("search", SearchMethod::Keyword, 1)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
}

#[tokio::test]
async fn no_match_returns_empty() {
    let finder = ToolFinder::new(registry_with_tools());
    let matches = finder
        .find("quantum chromodynamics", SearchMethod::Keyword, 5)
        .await
        .unwrap();
    assert!(matches.is_empty());
}

#[test]
fn search_method_parsing() {
    assert_eq!(SearchMethod::parse("keyword"), Some(SearchMethod::Keyword));
    assert_eq!(SearchMethod::parse("LLM"), Some(SearchMethod::Llm));
    assert_eq!(SearchMethod::parse("auto"), Some(SearchMethod::Auto));
    assert_eq!(SearchMethod::parse("telepathy"), None);
}

#[tokio::test]
async fn auto_without_models_uses_keyword() {
    let finder = ToolFinder::new(registry_with_tools());
    let matches = finder.find("weather", SearchMethod::Auto, 5).await.unwrap();
    assert_eq!(matches[0].name, "weather_lookup");
}

#[tokio::test]
async fn embedding_method_without_model_falls_back_to_keyword() {
    let finder = ToolFinder::new(registry_with_tools());
    let matches = finder
        .find("weather", SearchMethod::Embedding, 5)
        .await
        .unwrap();
    assert_eq!(matches[0].name, "weather_lookup");
}

/// Deterministic fake: the vector is the count of a few marker words, so
/// related texts land close together.
struct MarkerEmbedder;

#[async_trait]
impl EmbeddingModel for MarkerEmbedder {
    fn id(&self) -> &str {
        "marker-v1"
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                ["protein", "molecule", "literature", "weather"]
                    .iter()
                    .map(|marker| lower.matches(marker).count() as f32)
                    .collect()
            })
            .collect())
    }
}

#[tokio::test]
async fn embedding_search_ranks_by_cosine_similarity() {
    let dir = tempfile::tempdir().unwrap();
    let finder = ToolFinder::new(registry_with_tools())
        .with_embedding_model(Arc::new(MarkerEmbedder), Some(dir.path().to_path_buf()));
    let matches = finder
        .find("protein analysis", SearchMethod::Embedding, 2)
        .await
        .unwrap();
    assert_eq!(matches[0].name, "UniProt_get_entry");
    assert!(matches[0].score.unwrap() > 0.9);

    // Vectors were persisted keyed by model id.
    let cached: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("embeddings_"))
        .collect();
    assert_eq!(cached.len(), 1);
}

#[test]
fn cosine_similarity_basics() {
    use super::embedding::cosine_similarity;
    assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
}

/// Fake remote model returning a fixed shortlist.
struct ShortlistModel {
    reply: Value,
}

#[async_trait]
impl crate::engine::RemoteModel for ShortlistModel {
    async fn generate(
        &self,
        _prompts: &[String],
        _sampling: &SamplingParams,
        _return_json: bool,
        _json_schema: Option<&Value>,
    ) -> Result<Vec<Option<String>>> {
        Ok(vec![Some(self.reply.to_string())])
    }
}

#[tokio::test]
async fn llm_search_uses_model_shortlist() {
    let finder = ToolFinder::new(registry_with_tools()).with_remote_model(Arc::new(
        ShortlistModel {
            reply: json!(["PubMed_search", "UniProt_get_entry", "not_a_tool"]),
        },
    ));
    let matches = finder.find("literature", SearchMethod::Llm, 5).await.unwrap();
    let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["PubMed_search", "UniProt_get_entry"]);
}

#[tokio::test]
async fn auto_prefers_llm_when_available() {
    let finder = ToolFinder::new(registry_with_tools()).with_remote_model(Arc::new(
        ShortlistModel {
            reply: json!(["weather_lookup"]),
        },
    ));
    let matches = finder.find("anything", SearchMethod::Auto, 5).await.unwrap();
    assert_eq!(matches[0].name, "weather_lookup");
}

/// A model that always fails: the finder logs and falls back to keyword.
struct BrokenModel;

#[async_trait]
impl crate::engine::RemoteModel for BrokenModel {
    async fn generate(
        &self,
        _prompts: &[String],
        _sampling: &SamplingParams,
        _return_json: bool,
        _json_schema: Option<&Value>,
    ) -> Result<Vec<Option<String>>> {
        anyhow::bail!("model offline")
    }
}

#[tokio::test]
async fn llm_failure_falls_back_to_keyword() {
    let finder =
        ToolFinder::new(registry_with_tools()).with_remote_model(Arc::new(BrokenModel));
    let matches = finder.find("weather", SearchMethod::Llm, 5).await.unwrap();
    assert_eq!(matches[0].name, "weather_lookup");
}
