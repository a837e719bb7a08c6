use crate::matcher::ScoredCandidate;
use serde::{Deserialize, Serialize};

/// What to publish when nothing clears the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Fallback {
    /// Publish nothing; results always mean "confident match"
    #[default]
    Strict,
    /// Publish the `count` closest entries regardless of threshold
    Closest { count: usize },
}

impl Fallback {
    pub fn from_flag(enabled: bool, count: usize) -> Self {
        if enabled {
            Fallback::Closest { count }
        } else {
            Fallback::Strict
        }
    }
}

/// Meaning of a published result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    /// Every entry scored at or above the threshold
    Confident,
    /// Nothing cleared the threshold; entries are the closest available
    Closest,
}

/// Filter a descending best-of list down to the publishable set.
///
/// `best_of` must already be sorted by descending score; the output keeps
/// that order.
pub fn publish(
    best_of: &[ScoredCandidate],
    threshold: f32,
    fallback: Fallback,
) -> (Vec<ScoredCandidate>, ResultKind) {
    let confident: Vec<ScoredCandidate> = best_of
        .iter()
        .filter(|entry| entry.score >= threshold)
        .cloned()
        .collect();

    match fallback {
        Fallback::Closest { count } if confident.is_empty() && !best_of.is_empty() => {
            let closest = best_of.iter().take(count).cloned().collect();
            (closest, ResultKind::Closest)
        }
        _ => (confident, ResultKind::Confident),
    }
}
