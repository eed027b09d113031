//! SCRFD face locator via ONNX Runtime.
//!
//! Letterboxes the frame to the 640×640 model input, decodes the three
//! anchor-free stride heads into face boxes and suppresses overlaps.

use crate::session::FaceLocator;
use crate::types::Region;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// File name of the detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place an SCRFD ONNX export there)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when letterboxing a frame into the model input.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (size - new_w) / 2.0,
            pad_y: (size - new_h) / 2.0,
        }
    }

    /// Map a point from model input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_outputs = discover_outputs(&output_names);
        tracing::info!(path = %model_path.display(), outputs = ?output_names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            stride_outputs,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self
    }

    /// Detect faces, returning regions sorted by confidence (highest first).
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(frame.width(), frame.height());
        let input = preprocess(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox, self.confidence_threshold));
        }

        let regions = nms(candidates, self.nms_threshold);
        tracing::debug!(faces = regions.len(), "SCRFD detection");
        Ok(regions)
    }
}

impl FaceLocator for ScrfdLocator {
    type Error = DetectorError;

    fn locate(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        self.detect(frame)
    }
}

/// Letterbox a grayscale frame into a normalized 1×3×640×640 tensor.
///
/// Padding uses the model mean so it normalizes to 0.0.
fn preprocess(frame: &GrayImage, letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let pad_x = letterbox.pad_x.floor() as usize;
    let pad_y = letterbox.pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), 0.0);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
        if tx >= size || ty >= size {
            continue;
        }
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        // Grayscale replicated into all three channels
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = normalized;
        }
    }
    tensor
}

/// Find score/bbox outputs by name (`score_8`, `bbox_8`, ...), falling back to
/// the standard positional order `[scores 8/16/32, bboxes 8/16/32, ...]`.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| *n == format!("{prefix}_{stride}"));

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode the boxes of one stride head whose score exceeds `threshold`.
fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<Region> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&idx| scores[idx] > threshold)
        .filter_map(|idx| {
            let off = idx * 4;
            let d = bboxes.get(off..off + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);
            Some(Region {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[idx],
            })
        })
        .collect()
}

/// Non-maximum suppression; output is sorted by confidence, highest first.
fn nms(mut regions: Vec<Region>, iou_threshold: f32) -> Vec<Region> {
    regions.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Region> = Vec::new();
    for region in regions {
        if keep.iter().all(|kept| iou(kept, &region) <= iou_threshold) {
            keep.push(region);
        }
    }
    keep
}

/// Intersection-over-union of two regions.
fn iou(a: &Region, b: &Region) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
