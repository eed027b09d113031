//! Matching strategies: how a face crop becomes a representation, how two
//! representations are scored, and how the score is accepted.

use crate::gallery::GalleryLayout;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How the decision engine offers enrollment for a given strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentPolicy {
    /// Ask a yes/no question before asking for a label on an unknown face.
    pub confirm_unknown: bool,
    /// Offer re-enrollment after an identified face has been authorized.
    pub after_authorization: bool,
}

/// Feature representation and scoring rule shared by the gallery, matcher and
/// decision engine.
///
/// One engine instance uses exactly one strategy, so representations of
/// different strategies are never compared with each other.
pub trait MatchingStrategy {
    /// Stored form of one enrolled face image.
    type Repr: Clone + fmt::Debug;

    fn kind(&self) -> StrategyKind;

    /// Extract a representation from a grayscale face crop of any size.
    ///
    /// `None` means the crop carries no usable evidence.
    fn extract(&self, face: &GrayImage) -> Option<Self::Repr>;

    /// Similarity between a query and one stored representation.
    fn score(&self, query: &Self::Repr, stored: &Self::Repr) -> f64;

    /// Whether a best score is strong enough to call the face identified.
    fn accepts(&self, score: f64) -> bool;

    /// On-disk gallery layout this strategy's enrollments use.
    fn layout(&self) -> GalleryLayout {
        self.kind().layout()
    }

    fn enrollment_policy(&self) -> EnrollmentPolicy {
        self.kind().enrollment_policy()
    }
}

/// Strategy selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Histogram,
    Descriptors,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Histogram => "histogram",
            StrategyKind::Descriptors => "descriptors",
        }
    }

    pub fn layout(&self) -> GalleryLayout {
        match self {
            StrategyKind::Histogram => GalleryLayout::Flat,
            StrategyKind::Descriptors => GalleryLayout::PerIdentity,
        }
    }

    pub fn enrollment_policy(&self) -> EnrollmentPolicy {
        match self {
            StrategyKind::Histogram => EnrollmentPolicy {
                confirm_unknown: false,
                after_authorization: true,
            },
            StrategyKind::Descriptors => EnrollmentPolicy {
                confirm_unknown: true,
                after_authorization: false,
            },
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown strategy {0:?} (expected \"histogram\" or \"descriptors\")")]
pub struct ParseStrategyError(String);

impl FromStr for StrategyKind {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "histogram" | "hist" => Ok(StrategyKind::Histogram),
            "descriptors" | "descriptor" | "orb" => Ok(StrategyKind::Descriptors),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}
