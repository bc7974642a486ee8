use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{HookContext, OutputHook, output_text};
use crate::dispatch::{FunctionCall, RunOptions};
use crate::errors::is_error_record;

/// Character budget for each per-chunk summary; the consolidation pass
/// uses the configured `max_summary_length` instead.
const CHUNK_SUMMARY_BUDGET: usize = 500;

/// How far back from a chunk boundary to look for a sentence ending.
const BOUNDARY_LOOKBACK: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SummarizationSettings {
    composer_tool: String,
    chunk_size: usize,
    focus_areas: String,
    max_summary_length: usize,
    query_context: String,
}

impl Default for SummarizationSettings {
    fn default() -> Self {
        Self {
            composer_tool: "ToolOutputSummarizer".to_string(),
            chunk_size: 32_000,
            focus_areas: "key_findings_and_results".to_string(),
            max_summary_length: 3000,
            query_context: String::new(),
        }
    }
}

/// Shrinks oversized outputs with an external summarizer tool: split the
/// serialized text at sentence boundaries, summarize each chunk with a
/// focus-area prompt, then consolidate the partial summaries into a final
/// summary bounded by `max_summary_length`.
///
/// Fail-open by design: a summarizer error or an empty result propagates
/// as a hook failure, and the manager returns the original output.
pub struct SummarizationHook {
    settings: SummarizationSettings,
}

impl SummarizationHook {
    pub fn from_value(config: &Value) -> Result<Self> {
        let settings = if config.is_null() {
            SummarizationSettings::default()
        } else {
            serde_json::from_value(config.clone())?
        };
        anyhow::ensure!(settings.chunk_size > 0, "chunk_size must be positive");
        Ok(Self { settings })
    }

    /// Name of the summarizer tool this hook calls back into.
    pub fn summarizer_tool(&self) -> &str {
        &self.settings.composer_tool
    }

    async fn summarize(
        &self,
        ctx: &HookContext<'_>,
        text: &str,
        focus_areas: &str,
        max_length: usize,
    ) -> Option<String> {
        let call = FunctionCall::new(
            &self.settings.composer_tool,
            json!({
                "tool_output": text,
                "query_context": self.settings.query_context,
                "tool_name": ctx.tool_name,
                "focus_areas": focus_areas,
                "max_length": max_length,
            }),
        );
        // Sub-calls never consult the cache: summaries depend on the
        // focus/context pair, and the summarizer is not a read-only tool.
        let opts = RunOptions {
            use_cache: false,
            ..RunOptions::standard()
        };
        let result = ctx.dispatcher.run_one(&call, &opts).await;
        if is_error_record(&result) {
            warn!(
                "summarizer '{}' failed: {}",
                self.settings.composer_tool, result["error"]
            );
            return None;
        }
        extract_summary(&result).filter(|s| !s.trim().is_empty())
    }
}

#[async_trait]
impl OutputHook for SummarizationHook {
    fn name(&self) -> &str {
        "summarization"
    }

    async fn apply(&self, output: &Value, ctx: &HookContext<'_>) -> Result<Value> {
        let text = output_text(output);
        if text.len() < self.settings.chunk_size {
            // Short outputs pass through untouched.
            return Ok(output.clone());
        }

        let chunks = chunk_text(&text, self.settings.chunk_size);
        debug!(
            "summarizing {} chars of '{}' output in {} chunks",
            text.len(),
            ctx.tool_name,
            chunks.len()
        );

        let mut partials = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            match self
                .summarize(ctx, chunk, &self.settings.focus_areas, CHUNK_SUMMARY_BUDGET)
                .await
            {
                Some(summary) => partials.push(summary),
                None => warn!("chunk {}/{} summarization failed", index + 1, chunks.len()),
            }
        }
        anyhow::ensure!(!partials.is_empty(), "no chunk summaries generated");

        let summary = if partials.len() == 1 {
            partials.remove(0)
        } else {
            let combined = partials.join("\n\n");
            if combined.len() <= self.settings.max_summary_length {
                combined
            } else {
                self.summarize(
                    ctx,
                    &combined,
                    "consolidate_and_prioritize",
                    self.settings.max_summary_length,
                )
                .await
                .unwrap_or(combined)
            }
        };

        Ok(json!({
            "success": true,
            "original_length": text.len(),
            "summary_length": summary.len(),
            "chunks_processed": chunks.len(),
            "summary": summary,
            "tool_name": ctx.tool_name,
        }))
    }
}

/// Pull the summary string out of whatever shape the summarizer tool
/// returned: a bare string, `{"summary": ...}`, or `{"result": ...}`.
fn extract_summary(result: &Value) -> Option<String> {
    match result {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("summary")
            .or_else(|| map.get("result"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Split text into chunks of at most `chunk_size` bytes, preferring
/// sentence boundaries within the last [`BOUNDARY_LOOKBACK`] bytes of each
/// chunk. Boundary characters are ASCII, so splitting after one is always
/// UTF-8 safe; the fallback nudges forward to the next char boundary.
pub(crate) fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if text.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + chunk_size).min(bytes.len());
        if end < bytes.len() {
            let floor = start + chunk_size.saturating_sub(BOUNDARY_LOOKBACK);
            for i in (floor.max(start + 1)..end).rev() {
                if matches!(bytes[i - 1], b'.' | b'!' | b'?') {
                    end = i;
                    break;
                }
            }
            while end < bytes.len() && !text.is_char_boundary(end) {
                end += 1;
            }
        }
        let chunk = text[start..end].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn chunks_respect_size_bound() {
        let text = "word ".repeat(1000);
        for chunk in chunk_text(&text, 256) {
            assert!(chunk.len() <= 256);
        }
    }

    #[test]
    fn chunks_prefer_sentence_boundaries() {
        let text = format!("{}. {}", "a".repeat(90), "b".repeat(200));
        let chunks = chunk_text(&text, 100);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn chunking_covers_all_content() {
        let text = "The quick brown fox. ".repeat(500);
        let chunks = chunk_text(&text, 300);
        let rejoined: usize = chunks.iter().map(String::len).sum();
        // Trimmed whitespace is the only loss.
        assert!(rejoined >= text.trim().len() - chunks.len() * 2);
    }

    #[test]
    fn chunking_is_utf8_safe() {
        let text = "héllo wörld. ".repeat(300);
        let chunks = chunk_text(&text, 128);
        assert!(!chunks.is_empty());
        for chunk in chunks {
            assert!(chunk.is_char_boundary(0));
        }
    }

    #[test]
    fn extract_summary_handles_shapes() {
        assert_eq!(extract_summary(&Value::String("s".into())), Some("s".into()));
        assert_eq!(
            extract_summary(&serde_json::json!({"summary": "a"})),
            Some("a".into())
        );
        assert_eq!(
            extract_summary(&serde_json::json!({"result": "b"})),
            Some("b".into())
        );
        assert_eq!(extract_summary(&serde_json::json!(42)), None);
    }
}
