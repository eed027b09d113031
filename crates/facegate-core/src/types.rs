use serde::{Deserialize, Serialize};
use std::fmt;

/// Label a gallery entry is enrolled under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// Axis-aligned face region reported by a locator, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl Region {
    /// Region covering a whole `width`×`height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 1.0,
        }
    }

    /// Clamp the region to a `frame_width`×`frame_height` frame.
    ///
    /// Returns integer `(x, y, width, height)`, or `None` when nothing of the
    /// region lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(frame_width as f32).ceil();
        let y1 = (self.y + self.height).min(frame_height as f32).ceil();

        if !(x1 > x0 && y1 > y0) {
            return None;
        }

        let x = x0 as u32;
        let y = y0 as u32;
        let w = (x1 as u32).min(frame_width).saturating_sub(x);
        let h = (y1 as u32).min(frame_height).saturating_sub(y);
        if w == 0 || h == 0 {
            return None;
        }
        Some((x, y, w, h))
    }
}

/// Best `(identity, score)` pair found for a query across the gallery.
///
/// `score` is a correlation coefficient in [-1, 1] for histograms and a count
/// of accepted feature matches for descriptor sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity: Option<Identity>,
    pub score: f64,
}

impl MatchResult {
    /// The `(none, 0)` result of an empty gallery or a query without evidence.
    pub fn none() -> Self {
        Self {
            identity: None,
            score: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_inside() {
        let r = Region { x: 10.0, y: 20.0, width: 30.0, height: 40.0, confidence: 0.9 };
        assert_eq!(r.clamp_to(100, 100), Some((10, 20, 30, 40)));
    }

    #[test]
    fn test_clamp_overhanging_edges() {
        let r = Region { x: -5.0, y: 90.0, width: 20.0, height: 30.0, confidence: 0.9 };
        assert_eq!(r.clamp_to(100, 100), Some((0, 90, 15, 10)));
    }

    #[test]
    fn test_clamp_outside() {
        let r = Region { x: 150.0, y: 0.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert_eq!(r.clamp_to(100, 100), None);
    }

    #[test]
    fn test_full_region() {
        assert_eq!(Region::full(64, 48).clamp_to(64, 48), Some((0, 0, 64, 48)));
    }

    #[test]
    fn test_match_result_serializes_transparent_identity() {
        let result = MatchResult { identity: Some("alice".into()), score: 0.5 };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["identity"], "alice");
        assert_eq!(json["score"], 0.5);

        let none = serde_json::to_value(MatchResult::none()).unwrap();
        assert!(none["identity"].is_null());
    }
}
