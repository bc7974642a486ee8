use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::debug;

use crate::engine::{RemoteModel, SamplingParams};
use crate::tools::ToolSpec;

use super::{ToolMatch, keyword, match_for};

/// Above this many registered tools the candidate list is narrowed by a
/// keyword pre-pass so the prompt stays bounded.
const CANDIDATE_CAP: usize = 50;

/// Ask a remote model for a ranked shortlist. The model sees the query
/// and the candidate list and returns a JSON array of tool names,
/// best-first; unknown names in the reply are dropped.
pub async fn search(
    model: &dyn RemoteModel,
    specs: &[Arc<ToolSpec>],
    query: &str,
    limit: usize,
) -> Result<Vec<ToolMatch>> {
    let candidates: Vec<Arc<ToolSpec>> = if specs.len() > CANDIDATE_CAP {
        let narrowed = keyword::search(specs, query, CANDIDATE_CAP);
        if narrowed.is_empty() {
            specs.iter().take(CANDIDATE_CAP).cloned().collect()
        } else {
            let names: std::collections::HashSet<&str> =
                narrowed.iter().map(|m| m.name.as_str()).collect();
            specs
                .iter()
                .filter(|s| names.contains(s.name.as_str()))
                .cloned()
                .collect()
        }
    } else {
        specs.to_vec()
    };

    let mut listing = String::new();
    for spec in &candidates {
        let _ = writeln!(listing, "- {}: {}", spec.name, spec.description);
    }
    let prompt = format!(
        "You select the most relevant tools for a task.\n\
         Task: {}\n\nAvailable tools:\n{}\n\
         Reply with a JSON array of at most {} tool names from the list above, most relevant first.",
        query, listing, limit
    );

    let schema = json!({"type": "array", "items": {"type": "string"}});
    let sampling = SamplingParams {
        temperature: Some(0.0),
        max_tokens: Some(512),
    };
    let outputs = model
        .generate(&[prompt], &sampling, true, Some(&schema))
        .await
        .context("remote model generation failed")?;
    let reply = outputs
        .into_iter()
        .next()
        .flatten()
        .context("remote model returned no valid JSON shortlist")?;
    let names: Vec<String> =
        serde_json::from_str(&reply).context("shortlist is not a JSON array of strings")?;
    debug!("LLM shortlist: {:?}", names);

    let mut matches = Vec::new();
    for name in names {
        if let Some(spec) = candidates.iter().find(|s| s.name == name) {
            matches.push(match_for(spec, None));
        }
        if matches.len() == limit {
            break;
        }
    }
    Ok(matches)
}
