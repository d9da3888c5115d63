//! Approximate substring location for model-returned scene markers.
//!
//! The chat model quotes markers from the chapter text, but quotes drift:
//! dropped whitespace, normalised punctuation, the occasional wrong
//! character. The locator tries an exact match first, then slides a
//! marker-sized window across the text and scores each window with a
//! partial ratio over normalised strings.

use strsim::normalized_levenshtein;

/// Tunables for the sliding-window search. `step_divisor` controls window
/// overlap: step = max(1, marker_len / step_divisor).
#[derive(Debug, Clone, Copy)]
pub struct FuzzyOptions {
    pub threshold: f64,
    pub step_divisor: usize,
}

impl Default for FuzzyOptions {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            step_divisor: 4,
        }
    }
}

impl FuzzyOptions {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }
}

fn normalize_for_matching(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Similarity in [0, 1] between two normalised snippets. Containment counts
/// as a full match so that slightly offset windows still score high.
fn partial_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(b) || b.contains(a) {
        return 1.0;
    }
    normalized_levenshtein(a, b)
}

/// Locate `marker` inside `text`. Returns the byte offset of the best
/// window with ratio >= threshold, preferring the lowest offset on ties.
pub fn fuzzy_find(text: &str, marker: &str, opts: FuzzyOptions) -> Option<usize> {
    if marker.is_empty() || text.is_empty() {
        return None;
    }

    if let Some(pos) = text.find(marker) {
        return Some(pos);
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let marker_len = marker.chars().count();
    if chars.len() < marker_len {
        return None;
    }

    let marker_norm = normalize_for_matching(marker);
    let step = (marker_len / opts.step_divisor).max(1);

    let mut best_ratio = 0.0f64;
    let mut best_pos: Option<usize> = None;

    let mut i = 0usize;
    while i + marker_len <= chars.len() {
        let start_byte = chars[i].0;
        let end_byte = if i + marker_len < chars.len() {
            chars[i + marker_len].0
        } else {
            text.len()
        };
        let window = &text[start_byte..end_byte];
        let ratio = partial_ratio(&marker_norm, &normalize_for_matching(window));

        if ratio > best_ratio {
            best_ratio = ratio;
            best_pos = Some(start_byte);
        }
        i += step;
    }

    if best_ratio >= opts.threshold {
        best_pos
    } else {
        None
    }
}

/// Locate a marker and report the confidence of the match.
pub fn find_best_match(text: &str, marker: &str, opts: FuzzyOptions) -> Option<(usize, f64)> {
    let pos = fuzzy_find(text, marker, opts)?;

    let window: String = text[pos..].chars().take(marker.chars().count()).collect();
    let confidence = partial_ratio(
        &normalize_for_matching(marker),
        &normalize_for_matching(&window),
    );
    Some((pos, confidence))
}

/// Resolve both markers and check that the start precedes the end.
/// Returns `(start_pos, end_pos, is_valid)` with `None` for unlocated markers.
pub fn validate_marker_order(
    text: &str,
    start_marker: &str,
    end_marker: &str,
    opts: FuzzyOptions,
) -> (Option<usize>, Option<usize>, bool) {
    let start = find_best_match(text, start_marker, opts).map(|(p, _)| p);
    let end = find_best_match(text, end_marker, opts).map(|(p, _)| p);

    match (start, end) {
        (Some(s), Some(e)) => (start, end, s < e),
        _ => (start, end, false),
    }
}
