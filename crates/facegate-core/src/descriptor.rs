//! Binary local-feature representation: oriented FAST keypoints described by
//! rotated pairwise intensity tests, matched by Hamming distance with Lowe's
//! ratio test.

use crate::preprocess;
use crate::strategy::{MatchingStrategy, StrategyKind};
use image::GrayImage;
use rand::{Rng, SeedableRng};
use std::sync::OnceLock;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

pub const DEFAULT_MAX_FEATURES: usize = 2000;
pub const DEFAULT_FAST_THRESHOLD: u8 = 20;
pub const DEFAULT_MIN_MATCHES: usize = 25;
pub const DEFAULT_RATIO: f32 = 0.75;
pub const CLAHE_TILES: u32 = 8;
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;

/// Consecutive circle pixels a FAST-9 corner needs on one side of the centre.
const FAST_ARC: usize = 9;
/// Radius of the patch used for the intensity-centroid orientation.
const ORIENTATION_RADIUS: i32 = 15;
/// Coordinate range of the binary test pattern, before rotation.
const PATTERN_EXTENT: i32 = 13;
/// Keypoints closer than this to the border are discarded so that rotated
/// tests and the orientation patch stay inside the image.
const BORDER: u32 = 20;
const PATTERN_SEED: u64 = 0x0f0c_e6a7_e5eed;
const SMOOTHING_SIGMA: f32 = 2.0;

/// Bresenham circle of radius 3 used by FAST, clockwise from 12 o'clock.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

/// Oriented corner found in a normalized face crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: u32,
    pub y: u32,
    /// Orientation in radians.
    pub angle: f32,
    pub response: u32,
}

/// Ordered descriptors of one face image; never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorSet {
    descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    /// Wrap descriptors, returning `None` for an empty set.
    pub fn new(descriptors: Vec<Descriptor>) -> Option<Self> {
        if descriptors.is_empty() {
            None
        } else {
            Some(Self { descriptors })
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Number of query descriptors whose nearest neighbour in `stored` passes
    /// the ratio test against the second nearest.
    pub fn ratio_matches(&self, stored: &DescriptorSet, ratio: f32) -> usize {
        if stored.len() < 2 {
            return 0;
        }

        self.descriptors
            .iter()
            .filter(|query| {
                let (nearest, second) = two_nearest(query, &stored.descriptors);
                (nearest as f32) < ratio * second as f32
            })
            .count()
    }
}

/// Hamming distance between two binary descriptors.
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Distances to the nearest and second-nearest descriptor in `candidates`.
fn two_nearest(query: &Descriptor, candidates: &[Descriptor]) -> (u32, u32) {
    let mut best = u32::MAX;
    let mut second = u32::MAX;
    for candidate in candidates {
        let d = hamming(query, candidate);
        if d < best {
            second = best;
            best = d;
        } else if d < second {
            second = d;
        }
    }
    (best, second)
}

/// Keypoint detector and descriptor extractor.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    pub max_features: usize,
    pub fast_threshold: u8,
    pub clahe_tiles: u32,
    pub clahe_clip_limit: f32,
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self {
            max_features: DEFAULT_MAX_FEATURES,
            fast_threshold: DEFAULT_FAST_THRESHOLD,
            clahe_tiles: CLAHE_TILES,
            clahe_clip_limit: CLAHE_CLIP_LIMIT,
        }
    }
}

impl OrbExtractor {
    /// Normalize, equalize and describe a face crop.
    pub fn describe(&self, face: &GrayImage) -> Option<DescriptorSet> {
        if face.width() == 0 || face.height() == 0 {
            return None;
        }
        let mut normalized = preprocess::normalize(face);
        preprocess::clahe(&mut normalized, self.clahe_tiles, self.clahe_clip_limit);

        let keypoints = self.detect(&normalized);
        if keypoints.is_empty() {
            return None;
        }

        let smoothed = image::imageops::blur(&normalized, SMOOTHING_SIGMA);
        let descriptors = keypoints.iter().map(|kp| describe_keypoint(&smoothed, kp)).collect();
        DescriptorSet::new(descriptors)
    }

    /// FAST-9 corners with 3×3 non-maximum suppression, strongest first,
    /// capped at `max_features`.
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let (w, h) = image.dimensions();
        if w <= 2 * BORDER || h <= 2 * BORDER {
            return Vec::new();
        }

        let mut responses = vec![0u32; (w * h) as usize];
        for y in BORDER..h - BORDER {
            for x in BORDER..w - BORDER {
                responses[(y * w + x) as usize] = fast_response(image, x, y, self.fast_threshold);
            }
        }

        let mut keypoints = Vec::new();
        for y in BORDER..h - BORDER {
            for x in BORDER..w - BORDER {
                let idx = (y * w + x) as usize;
                let r = responses[idx];
                if r == 0 || !is_local_maximum(&responses, w, x, y) {
                    continue;
                }
                keypoints.push(Keypoint {
                    x,
                    y,
                    angle: orientation(image, x, y),
                    response: r,
                });
            }
        }

        // Stable sort keeps raster order among equal responses.
        keypoints.sort_by(|a, b| b.response.cmp(&a.response));
        keypoints.truncate(self.max_features);
        keypoints
    }
}

/// FAST-9 corner response: sum of the threshold-exceeding differences on the
/// side (brighter or darker) that forms a contiguous arc, or 0.
fn fast_response(image: &GrayImage, x: u32, y: u32, threshold: u8) -> u32 {
    let center = image.get_pixel(x, y).0[0] as i32;
    let t = threshold as i32;

    let mut ring = [0i32; 16];
    for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
        ring[i] = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as i32;
    }

    let brighter = ring.map(|p| p > center + t);
    let darker = ring.map(|p| p < center - t);

    let mut response = 0u32;
    if has_arc(&brighter) {
        response = response.max(ring.iter().filter(|&&p| p > center + t).map(|&p| (p - center - t) as u32).sum());
    }
    if has_arc(&darker) {
        response = response.max(ring.iter().filter(|&&p| p < center - t).map(|&p| (center - t - p) as u32).sum());
    }
    response
}

/// Whether at least `FAST_ARC` consecutive entries (wrapping) are set.
fn has_arc(flags: &[bool; 16]) -> bool {
    let mut run = 0usize;
    for i in 0..32 {
        if flags[i % 16] {
            run += 1;
            if run >= FAST_ARC {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Raster-order tie-break: equal neighbours already visited win.
fn is_local_maximum(responses: &[u32], w: u32, x: u32, y: u32) -> bool {
    let r = responses[(y * w + x) as usize];
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = (x as i32 + dx) as u32;
            let ny = (y as i32 + dy) as u32;
            let n = responses[(ny * w + nx) as usize];
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if n > r || (earlier && n == r) {
                return false;
            }
        }
    }
    true
}

/// Intensity-centroid orientation over a circular patch.
fn orientation(image: &GrayImage, x: u32, y: u32) -> f32 {
    let mut m01 = 0i64;
    let mut m10 = 0i64;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let p = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as i64;
            m10 += dx as i64 * p;
            m01 += dy as i64 * p;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

/// Fixed sampling pattern of 256 point pairs `(x1, y1, x2, y2)`.
fn pattern() -> &'static [[i32; 4]; 256] {
    static PATTERN: OnceLock<[[i32; 4]; 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = rand::rngs::StdRng::seed_from_u64(PATTERN_SEED);
        let mut pairs = [[0i32; 4]; 256];
        for pair in pairs.iter_mut() {
            loop {
                let candidate = [
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                ];
                if candidate[0] != candidate[2] || candidate[1] != candidate[3] {
                    *pair = candidate;
                    break;
                }
            }
        }
        pairs
    })
}

/// Steered binary tests around one keypoint on the smoothed image.
fn describe_keypoint(smoothed: &GrayImage, kp: &Keypoint) -> Descriptor {
    let (sin, cos) = kp.angle.sin_cos();
    let max_x = smoothed.width() as i32 - 1;
    let max_y = smoothed.height() as i32 - 1;

    let sample = |px: i32, py: i32| -> u8 {
        let rx = (cos * px as f32 - sin * py as f32).round() as i32;
        let ry = (sin * px as f32 + cos * py as f32).round() as i32;
        let sx = (kp.x as i32 + rx).clamp(0, max_x) as u32;
        let sy = (kp.y as i32 + ry).clamp(0, max_y) as u32;
        smoothed.get_pixel(sx, sy).0[0]
    };

    let mut descriptor = [0u8; 32];
    for (bit, [x1, y1, x2, y2]) in pattern().iter().enumerate() {
        if sample(*x1, *y1) < sample(*x2, *y2) {
            descriptor[bit / 8] |= 1 << (bit % 8);
        }
    }
    descriptor
}

/// Descriptor-set strategy: CLAHE + oriented binary features, scored by the
/// number of ratio-test matches.
#[derive(Debug, Clone)]
pub struct DescriptorStrategy {
    extractor: OrbExtractor,
    min_matches: usize,
    ratio: f32,
}

impl DescriptorStrategy {
    pub fn new(extractor: OrbExtractor, min_matches: usize, ratio: f32) -> Self {
        Self {
            extractor,
            min_matches,
            ratio,
        }
    }

    pub fn min_matches(&self) -> usize {
        self.min_matches
    }
}

impl Default for DescriptorStrategy {
    fn default() -> Self {
        Self::new(OrbExtractor::default(), DEFAULT_MIN_MATCHES, DEFAULT_RATIO)
    }
}

impl MatchingStrategy for DescriptorStrategy {
    type Repr = DescriptorSet;

    fn kind(&self) -> StrategyKind {
        StrategyKind::Descriptors
    }

    fn extract(&self, face: &GrayImage) -> Option<DescriptorSet> {
        self.extractor.describe(face)
    }

    fn score(&self, query: &DescriptorSet, stored: &DescriptorSet) -> f64 {
        query.ratio_matches(stored, self.ratio) as f64
    }

    fn accepts(&self, score: f64) -> bool {
        score >= self.min_matches as f64
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Random blocky texture, rich in corners.
    pub(crate) fn textured(seed: u64, size: u32, block: u32) -> GrayImage {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let cells = size.div_ceil(block);
        let levels: Vec<u8> = (0..cells * cells).map(|_| rng.gen_range(0..=255)).collect();
        GrayImage::from_fn(size, size, |x, y| image::Luma([levels[((y / block) * cells + x / block) as usize]]))
    }

    fn unique_count(set: &DescriptorSet) -> usize {
        let mut counts: HashMap<Descriptor, usize> = HashMap::new();
        for d in set.descriptors() {
            *counts.entry(*d).or_default() += 1;
        }
        counts.values().filter(|&&c| c == 1).count()
    }

    #[test]
    fn test_hamming() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(hamming(&a, &b), 0);
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(hamming(&a, &b), 11);
    }

    #[test]
    fn test_has_arc_wraps() {
        let mut flags = [false; 16];
        for i in [12, 13, 14, 15, 0, 1, 2, 3, 4] {
            flags[i] = true;
        }
        assert!(has_arc(&flags));
        flags[0] = false;
        assert!(!has_arc(&flags));
    }

    #[test]
    fn test_flat_image_has_no_descriptors() {
        let face = GrayImage::from_pixel(200, 200, image::Luma([128]));
        assert!(DescriptorStrategy::default().extract(&face).is_none());
    }

    #[test]
    fn test_tiny_crop_has_no_descriptors() {
        let face = GrayImage::from_pixel(0, 10, image::Luma([0]));
        assert!(DescriptorStrategy::default().extract(&face).is_none());
    }

    #[test]
    fn test_textured_face_is_described() {
        let strategy = DescriptorStrategy::default();
        let set = strategy.extract(&textured(3, 200, 10)).unwrap();
        assert!(set.len() >= DEFAULT_MIN_MATCHES, "only {} descriptors", set.len());
        assert!(set.len() <= DEFAULT_MAX_FEATURES);
    }

    #[test]
    fn test_max_features_respected() {
        let extractor = OrbExtractor { max_features: 10, ..OrbExtractor::default() };
        let set = extractor.describe(&textured(3, 200, 10)).unwrap();
        assert!(set.len() <= 10);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let strategy = DescriptorStrategy::default();
        let face = textured(11, 160, 8);
        assert_eq!(strategy.extract(&face), strategy.extract(&face));
    }

    #[test]
    fn test_self_match_counts_unique_descriptors() {
        let strategy = DescriptorStrategy::default();
        let set = strategy.extract(&textured(5, 200, 10)).unwrap();
        let score = strategy.score(&set, &set);
        assert_eq!(score as usize, unique_count(&set));
        assert!(strategy.accepts(score));
    }

    #[test]
    fn test_self_match_of_distinct_set_equals_len() {
        let descriptors: Vec<Descriptor> = (0..40u8)
            .map(|i| {
                let mut d = [0u8; 32];
                d[(i / 8) as usize] = 1 << (i % 8);
                d[31 - (i % 8) as usize] ^= 0xf0;
                d
            })
            .collect();
        let set = DescriptorSet::new(descriptors).unwrap();
        assert_eq!(unique_count(&set), 40);
        assert_eq!(set.ratio_matches(&set, DEFAULT_RATIO), 40);
    }

    #[test]
    fn test_unrelated_textures_score_low() {
        let strategy = DescriptorStrategy::default();
        let bob = strategy.extract(&textured(1, 200, 10)).unwrap();
        let noise = strategy.extract(&textured(2, 200, 3)).unwrap();
        let score = strategy.score(&noise, &bob);
        assert!(!strategy.accepts(score), "score = {score}");
    }

    #[test]
    fn test_pixel_noise_is_not_identified() {
        let strategy = DescriptorStrategy::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(77);
        let noise = GrayImage::from_fn(200, 200, |_, _| image::Luma([rng.gen_range(0..=255)]));

        // Either nothing survives smoothing or whatever does matches nobody.
        let Some(query) = strategy.extract(&noise) else {
            return;
        };
        for seed in 1..=3 {
            let stored = strategy.extract(&textured(seed, 200, 10)).unwrap();
            let score = strategy.score(&query, &stored);
            assert!(!strategy.accepts(score), "seed {seed}: score = {score}");
        }
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_match() {
        let query = DescriptorSet::new(vec![[0u8; 32]]).unwrap();
        let mut near = [0u8; 32];
        near[0] = 0b1;
        let mut also_near = [0u8; 32];
        also_near[1] = 0b1;
        let stored = DescriptorSet::new(vec![near, also_near]).unwrap();
        // 1 < 0.75 * 1 fails: both neighbours are equally close.
        assert_eq!(query.ratio_matches(&stored, 0.75), 0);

        let mut far = [0u8; 32];
        far[2] = 0xff;
        let stored = DescriptorSet::new(vec![near, far]).unwrap();
        assert_eq!(query.ratio_matches(&stored, 0.75), 1);
    }

    #[test]
    fn test_single_stored_descriptor_gives_no_candidates() {
        let query = DescriptorSet::new(vec![[0u8; 32]]).unwrap();
        let stored = DescriptorSet::new(vec![[0u8; 32]]).unwrap();
        assert_eq!(query.ratio_matches(&stored, 0.75), 0);
    }

    #[test]
    fn test_empty_set_is_rejected() {
        assert!(DescriptorSet::new(Vec::new()).is_none());
    }

    #[test]
    fn test_min_matches_is_inclusive() {
        let strategy = DescriptorStrategy::new(OrbExtractor::default(), 25, 0.75);
        assert!(strategy.accepts(25.0));
        assert!(!strategy.accepts(24.0));
    }
}
