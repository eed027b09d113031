//! Query-against-gallery scoring.

use crate::gallery::Gallery;
use crate::strategy::MatchingStrategy;
use crate::types::MatchResult;

/// Best score of a query against one identity's stored representations.
///
/// An identity with no representations scores 0.
pub fn score_identity<S: MatchingStrategy>(strategy: &S, query: &S::Repr, stored: &[S::Repr]) -> f64 {
    stored
        .iter()
        .map(|repr| strategy.score(query, repr))
        .fold(0.0f64, f64::max)
}

/// Find the identity whose representations best match the query.
///
/// The running best starts at `(none, 0)` and is only replaced by a strictly
/// greater score, so ties keep the identity seen first and non-positive
/// scores never name an identity. Every identity is scored, no early exit.
pub fn identify<S: MatchingStrategy>(strategy: &S, query: &S::Repr, gallery: &Gallery<S::Repr>) -> MatchResult {
    let mut best = MatchResult::none();

    for entry in gallery.iter() {
        let score = score_identity(strategy, query, &entry.representations);
        tracing::debug!(identity = %entry.identity, score, "identity scored");
        if score > best.score {
            best = MatchResult {
                identity: Some(entry.identity.clone()),
                score,
            };
        }
    }

    tracing::info!(
        identity = best.identity.as_ref().map(|i| i.as_str()),
        score = best.score,
        "best match"
    );
    best
}
