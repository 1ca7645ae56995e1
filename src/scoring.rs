//! Pure ladder feature scores for media resolution.
//!
//! Every function here is deterministic and side-effect free; the resolver
//! combines them with configured weights. Identical inputs always produce
//! identical rankings.

use crate::media_index::MediaKind;

/// Kind-priority score: the first entry of `priority` scores highest,
/// descending by position. Kinds absent from the list score 0.
#[must_use]
pub fn score_ext(kind: MediaKind, priority: &[MediaKind]) -> f64 {
    match priority.iter().position(|k| *k == kind) {
        Some(pos) => (priority.len() - pos) as f64,
        None => 0.0,
    }
}

/// Sequence-number proximity. Exact match scores 1.0, decaying with
/// absolute distance. A candidate with any sequence beats one with none
/// when no target is known.
#[must_use]
pub fn score_seq(target: Option<u64>, candidate: Option<u64>) -> f64 {
    match (target, candidate) {
        (None, None) => 0.0,
        (None, Some(_)) => 0.1,
        (Some(_), None) => 0.0,
        (Some(t), Some(c)) => 1.0 / (1.0 + t.abs_diff(c) as f64),
    }
}

/// Modification-time proximity: monotonically decreasing in the absolute
/// delta, 1.0 at zero.
#[must_use]
pub fn score_mtime(delta_seconds: f64) -> f64 {
    1.0 / (1.0 + delta_seconds.abs())
}

/// Hint overlap: 1.0 when any extracted hint token appears among the
/// candidate's name tokens.
#[must_use]
pub fn score_hint(hints: &std::collections::BTreeSet<String>, name_tokens: &[String]) -> f64 {
    if hints.is_empty() {
        return 0.0;
    }
    if name_tokens.iter().any(|t| hints.contains(t)) {
        1.0
    } else {
        0.0
    }
}
