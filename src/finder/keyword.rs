use std::sync::Arc;

use crate::tools::ToolSpec;

use super::{ToolMatch, match_for};

/// Case-insensitive token match across name and description, ranked by
/// the number of matching query tokens (name matches weighted double).
pub fn search(specs: &[Arc<ToolSpec>], query: &str, limit: usize) -> Vec<ToolMatch> {
    let tokens: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(u32, &Arc<ToolSpec>)> = specs
        .iter()
        .filter_map(|spec| {
            let name = spec.name.to_lowercase();
            let description = spec.description.to_lowercase();
            let mut score = 0u32;
            for token in &tokens {
                if name.contains(token) {
                    score += 2;
                } else if description.contains(token) {
                    score += 1;
                }
            }
            (score > 0).then_some((score, spec))
        })
        .collect();

    // Ties break alphabetically for deterministic output.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    scored
        .into_iter()
        .take(limit)
        .map(|(score, spec)| match_for(spec, Some(score as f32)))
        .collect()
}
