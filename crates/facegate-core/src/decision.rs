//! Accept/reject classification of a best match and the operator prompts it
//! routes to.

use crate::strategy::MatchingStrategy;
use crate::types::{Identity, MatchResult};

/// Answers accepted as "yes" by [`is_affirmative`], compared case-insensitively.
pub const AFFIRMATIVE_ANSWERS: [&str; 4] = ["y", "yes", "s", "sim"];

pub const AUTHORIZE_QUESTION: &str = "Authorize? (y/N)";
pub const SAVE_FACE_QUESTION: &str = "Save this face for enrollment? (y/N)";
pub const LABEL_QUESTION: &str = "Name for this person (blank for automatic):";

/// Operator interaction the decision engine depends on.
pub trait Prompt {
    /// Ask a yes/no question. Anything but an affirmative answer is `false`.
    fn confirm(&mut self, question: &str) -> bool;

    /// Ask for free text; may return an empty string.
    fn ask_text(&mut self, question: &str) -> String;
}

pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim();
    AFFIRMATIVE_ANSWERS.iter().any(|a| a.eq_ignore_ascii_case(answer))
}

/// Classification of the best match for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Identified { identity: Identity, score: f64 },
    Unknown { closest: Option<Identity>, score: f64 },
}

impl Decision {
    pub fn score(&self) -> f64 {
        match self {
            Decision::Identified { score, .. } | Decision::Unknown { score, .. } => *score,
        }
    }
}

/// Apply the strategy's acceptance rule to a match result.
///
/// A result without an identity is always unknown.
pub fn decide<S: MatchingStrategy>(strategy: &S, result: MatchResult) -> Decision {
    match result.identity {
        Some(identity) if strategy.accepts(result.score) => Decision::Identified {
            identity,
            score: result.score,
        },
        closest => Decision::Unknown {
            closest,
            score: result.score,
        },
    }
}
