//! Fuzzy text similarity for error signatures.

use std::collections::HashSet;

/// Normalize text into a token set.
///
/// Lowercases, splits on anything non-alphanumeric (paths included), and
/// collapses every digit run to `#` so line numbers and addresses compare equal.
pub fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(normalize_token)
        .collect()
}

fn normalize_token(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut in_digits = false;
    for ch in token.chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            out.extend(ch.to_lowercase());
            in_digits = false;
        }
    }
    out
}

/// Jaccard similarity of the two token sets, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}
