//! Face crop normalization and contrast-limited adaptive histogram equalization.

use crate::types::Region;
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Side length of the canonical square every face crop is resized to.
pub const CANONICAL_SIZE: u32 = 200;

/// Cut a located region out of a grayscale frame.
///
/// Returns `None` when the region lies entirely outside the frame.
pub fn crop_region(frame: &GrayImage, region: &Region) -> Option<GrayImage> {
    let (x, y, w, h) = region.clamp_to(frame.width(), frame.height())?;
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Resize a face crop to the canonical 200×200 size with bilinear interpolation.
pub fn normalize(face: &GrayImage) -> GrayImage {
    if face.width() == CANONICAL_SIZE && face.height() == CANONICAL_SIZE {
        return face.clone();
    }
    imageops::resize(face, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle)
}

/// Apply Contrast-Limited Adaptive Histogram Equalization in place.
///
/// The image is split into a `tiles`×`tiles` grid. Each tile histogram is
/// clipped at `clip_limit` times its mean bin height, the excess is spread
/// evenly over all bins, and the resulting lookup tables are bilinearly
/// interpolated between neighbouring tile centres.
pub fn clahe(image: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let t = tiles as usize;
    if t == 0 || w < t || h < t {
        return;
    }

    let tile_w = w / t;
    let tile_h = h / t;
    let tile_pixels = (tile_w * tile_h) as u32;
    let clip = ((clip_limit * tile_pixels as f32) / 256.0).max(1.0) as u32;

    let luts: Vec<[u8; 256]> = (0..t * t)
        .map(|idx| {
            let (row, col) = (idx / t, idx % t);
            tile_lut(image, col * tile_w, row * tile_h, tile_w, tile_h, clip)
        })
        .collect();

    let pixels = image.as_mut();
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let p = pixels[y * w + x] as usize;
            let tl = luts[r0 * t + c0][p] as f32;
            let tr = luts[r0 * t + c1][p] as f32;
            let bl = luts[r1 * t + c0][p] as f32;
            let br = luts[r1 * t + c1][p] as f32;

            let top = tl * (1.0 - dx) + tr * dx;
            let bottom = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bottom * dy;
            pixels[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clipped-histogram equalization lookup table for one tile.
fn tile_lut(image: &GrayImage, x0: usize, y0: usize, tile_w: usize, tile_h: usize, clip: u32) -> [u8; 256] {
    let w = image.width() as usize;
    let data = image.as_raw();

    let mut hist = [0u32; 256];
    for y in y0..y0 + tile_h {
        for &p in &data[y * w + x0..y * w + x0 + tile_w] {
            hist[p as usize] += 1;
        }
    }

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let redist = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += redist;
        if i < leftover {
            *bin += 1;
        }
    }

    let total = (tile_w * tile_h) as f32;
    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        cumulative += count;
        lut[i] = (cumulative as f32 * 255.0 / total).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
