//! Intensity-histogram representation scored by correlation.

use crate::preprocess;
use crate::strategy::{MatchingStrategy, StrategyKind};
use image::GrayImage;

pub const HISTOGRAM_BINS: usize = 256;

/// Correlation a histogram match must exceed to count as identified.
pub const DEFAULT_HISTOGRAM_THRESHOLD: f64 = 0.85;

/// 256-bin intensity distribution of a normalized face crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bins: [u32; HISTOGRAM_BINS],
}

impl Histogram {
    /// Count pixel intensities of an already normalized image.
    pub fn of(image: &GrayImage) -> Self {
        let mut bins = [0u32; HISTOGRAM_BINS];
        for &p in image.as_raw() {
            bins[p as usize] += 1;
        }
        Self { bins }
    }

    pub fn bins(&self) -> &[u32; HISTOGRAM_BINS] {
        &self.bins
    }

    /// Normalized correlation coefficient between two histograms, in [-1, 1].
    ///
    /// Two flat histograms correlate perfectly; a flat histogram against a
    /// non-flat one is treated as uncorrelated.
    pub fn correlation(&self, other: &Histogram) -> f64 {
        let n = HISTOGRAM_BINS as f64;
        let mean_a = self.bins.iter().map(|&v| v as f64).sum::<f64>() / n;
        let mean_b = other.bins.iter().map(|&v| v as f64).sum::<f64>() / n;

        let mut cov = 0.0f64;
        let mut var_a = 0.0f64;
        let mut var_b = 0.0f64;
        for (&a, &b) in self.bins.iter().zip(other.bins.iter()) {
            let da = a as f64 - mean_a;
            let db = b as f64 - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        let denom = (var_a * var_b).sqrt();
        if denom < f64::EPSILON {
            return if var_a < f64::EPSILON && var_b < f64::EPSILON { 1.0 } else { 0.0 };
        }
        cov / denom
    }
}

/// Histogram strategy: resize to the canonical size, count intensities,
/// compare by correlation.
#[derive(Debug, Clone)]
pub struct HistogramStrategy {
    threshold: f64,
}

impl HistogramStrategy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for HistogramStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_HISTOGRAM_THRESHOLD)
    }
}

impl MatchingStrategy for HistogramStrategy {
    type Repr = Histogram;

    fn kind(&self) -> StrategyKind {
        StrategyKind::Histogram
    }

    fn extract(&self, face: &GrayImage) -> Option<Histogram> {
        if face.width() == 0 || face.height() == 0 {
            return None;
        }
        Some(Histogram::of(&preprocess::normalize(face)))
    }

    fn score(&self, query: &Histogram, stored: &Histogram) -> f64 {
        query.correlation(stored)
    }

    fn accepts(&self, score: f64) -> bool {
        score > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn noise(seed: u64, w: u32, h: u32, lo: u8, hi: u8) -> GrayImage {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        GrayImage::from_fn(w, h, |_, _| image::Luma([rng.gen_range(lo..=hi)]))
    }

    #[test]
    fn test_histogram_counts_every_pixel() {
        let face = noise(1, 120, 90, 0, 255);
        let hist = HistogramStrategy::default().extract(&face).unwrap();
        let total: u32 = hist.bins().iter().sum();
        assert_eq!(total, 200 * 200);
    }

    #[test]
    fn test_self_correlation_is_one() {
        let strategy = HistogramStrategy::default();
        let face = noise(7, 150, 150, 30, 220);
        let a = strategy.extract(&face).unwrap();
        let b = strategy.extract(&face).unwrap();
        assert!((strategy.score(&a, &b) - 1.0).abs() < 1e-12);
        assert!(strategy.accepts(strategy.score(&a, &b)));
    }

    #[test]
    fn test_disjoint_intensity_ranges_do_not_match() {
        let strategy = HistogramStrategy::default();
        let dark = strategy.extract(&noise(1, 200, 200, 10, 60)).unwrap();
        let bright = strategy.extract(&noise(2, 200, 200, 160, 250)).unwrap();
        let score = strategy.score(&dark, &bright);
        assert!(score < 0.1, "score = {score}");
        assert!(!strategy.accepts(score));
    }

    #[test]
    fn test_threshold_is_strict() {
        let strategy = HistogramStrategy::new(0.85);
        assert!(!strategy.accepts(0.85));
        assert!(strategy.accepts(0.8500001));
    }

    #[test]
    fn test_flat_histograms() {
        let flat = Histogram { bins: [4; HISTOGRAM_BINS] };
        let mut peaked = flat.clone();
        peaked.bins[0] = 100;
        assert_eq!(flat.correlation(&flat), 1.0);
        assert_eq!(flat.correlation(&peaked), 0.0);
    }

    #[test]
    fn test_empty_crop_yields_nothing() {
        assert!(HistogramStrategy::default().extract(&GrayImage::new(0, 0)).is_none());
    }
}
