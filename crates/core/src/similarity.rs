//! Name similarity ranking for "did you mean" model suggestions.
//!
//! Scores are the Dice coefficient over character bigrams of the
//! lowercased file stems, so `dreamshaper_8.safetensors` ranks
//! `dreamshaper_7.safetensors` far above `juggernaut_xl.safetensors`.

use std::collections::HashMap;

/// Minimum score for a candidate to be suggested.
pub const MIN_SIMILARITY: f64 = 0.4;

/// Default number of suggestions returned.
pub const DEFAULT_SUGGESTION_LIMIT: usize = 5;

/// Rank `candidates` by similarity to `target`, best first.
///
/// Candidates scoring below [`MIN_SIMILARITY`] and exact matches of
/// `target` itself are dropped. Ties are broken by name.
pub fn rank_similar<'a, I>(target: &str, candidates: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let target_bigrams = bigrams(stem(target));
    let mut scored: Vec<(f64, &str)> = candidates
        .into_iter()
        .filter(|c| *c != target)
        .map(|c| (dice(&target_bigrams, &bigrams(stem(c))), c))
        .filter(|(score, _)| *score >= MIN_SIMILARITY)
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.dedup_by(|a, b| a.1 == b.1);
    scored
        .into_iter()
        .take(limit)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// File name without its final extension, lowercased.
fn stem(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let base = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };
    base.to_lowercase()
}

fn bigrams(s: String) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = s.chars().collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

fn dice(a: &HashMap<(char, char), usize>, b: &HashMap<(char, char), usize>) -> f64 {
    let total: usize = a.values().sum::<usize>() + b.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let shared: usize = a
        .iter()
        .map(|(k, n)| (*n).min(*b.get(k).unwrap_or(&0)))
        .sum();
    (2 * shared) as f64 / total as f64
}
