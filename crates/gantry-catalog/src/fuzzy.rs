//! Approximate-match suggestions for unresolvable model names, based on
//! a plain Levenshtein ratio.

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j] + cost)
                .min(prev[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Similarity in [0, 1]; case-insensitive.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// The `limit` closest candidates scoring at or above `threshold`,
/// best first.
pub fn top_matches<'a, I>(candidates: I, name: &str, threshold: f64, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut scored: Vec<(f64, &str)> = candidates
        .into_iter()
        .map(|c| (ratio(c, name), c))
        .filter(|(score, _)| *score >= threshold)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, c)| c.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_identical() {
        assert_eq!(ratio("model.ckpt", "model.ckpt"), 1.0);
        assert_eq!(ratio("Model.CKPT", "model.ckpt"), 1.0);
    }

    #[test]
    fn test_ratio_one_edit() {
        let score = ratio("dreamshaper_8.safetensors", "dreamshaper_9.safetensors");
        assert!(score > 0.9);
    }

    #[test]
    fn test_top_matches_respects_threshold_and_limit() {
        let candidates = vec![
            "dreamshaper_8.safetensors",
            "dreamshaper_7.safetensors",
            "dreamshaper_6.safetensors",
            "vae-ft-mse.ckpt",
        ];
        let matches = top_matches(
            candidates.iter().copied(),
            "dreamshaper_9.safetensors",
            0.9,
            2,
        );
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.starts_with("dreamshaper")));
    }

    #[test]
    fn test_top_matches_empty_when_nothing_close() {
        let matches = top_matches(
            ["vae-ft-mse.ckpt"].into_iter(),
            "ghost_model.safetensors",
            0.9,
            2,
        );
        assert!(matches.is_empty());
    }
}
