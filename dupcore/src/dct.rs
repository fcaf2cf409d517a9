//! The perceptual DCT hash: downsample to a fixed luminance grid, run a 2D DCT, and pack
//! the sign bits of the top-left low-frequency block into a 64-bit fingerprint.
//!
//! The 2D DCT itself is a row-pass, transpose, column-pass, transpose via
//! `rustdct::DctPlanner`, with the sign-bit packing done over the top-left 8x8 AC block.

use std::sync::Arc;

use image::{imageops::FilterType, GrayImage};
use rustdct::{Dct2, DctPlanner};

use crate::hamming::Hamming;

const DOWNSAMPLE_SIZE: usize = 32;
const DCT_WINDOW: usize = 8;

/// 2D DCT-II of a square `size x size` row-major matrix of `f32` samples, normalized the
/// way `dct_ops.rs::dct2_2d` does: each pass is a `plan_dct2().process(...)` scaled by
/// `2/size`; doing it twice (once per dimension) folds in the `4/(w*h)` factor used there.
fn dct2_2d(mut data: Vec<f32>, size: usize) -> Vec<f32> {
    let mut planner: DctPlanner<f32> = DctPlanner::new();
    let dct: Arc<dyn Dct2<f32>> = planner.plan_dct2(size);

    // Row pass.
    for row in data.chunks_mut(size) {
        dct.process_dct2(row);
    }
    let scale = 2.0 / size as f32;
    for v in data.iter_mut() {
        *v *= scale;
    }

    // Transpose, column pass (now rows), transpose back.
    let mut transposed = vec![0.0f32; data.len()];
    transpose::transpose(&data, &mut transposed, size, size);
    for row in transposed.chunks_mut(size) {
        dct.process_dct2(row);
    }
    for v in transposed.iter_mut() {
        *v *= scale;
    }
    let mut result = vec![0.0f32; transposed.len()];
    transpose::transpose(&transposed, &mut result, size, size);
    result
}

/// Pack the sign bits of the top-left `DCT_WINDOW x DCT_WINDOW` block (excluding the DC
/// term at `(0,0)`) into a `u64`, most-significant coefficient first. This mirrors
/// `dct_hasher.rs::bittify`'s bit-packing idea, applied to our 8x8 window.
fn bittify(coeffs: &[f32], size: usize) -> Hamming {
    let mut hash: u64 = 0;
    let mut bit = 0u32;
    for y in 0..DCT_WINDOW {
        for x in 0..DCT_WINDOW {
            if x == 0 && y == 0 {
                continue; // DC term carries no perceptual discriminating power here
            }
            let v = coeffs[y * size + x];
            if v > 0.0 {
                hash |= 1 << bit;
            }
            bit += 1;
        }
    }
    Hamming(hash)
}

/// Compute the 64-bit perceptual hash of an already-decoded image: downsample to
/// `32x32` grayscale, run the 2D DCT, keep the top-left `8x8` block's sign bits.
pub fn dct_hash(img: &image::DynamicImage) -> Hamming {
    let gray: GrayImage = img
        .resize_exact(
            DOWNSAMPLE_SIZE as u32,
            DOWNSAMPLE_SIZE as u32,
            FilterType::Lanczos3,
        )
        .to_luma8();

    let samples: Vec<f32> = gray.pixels().map(|p| p.0[0] as f32).collect();
    let coeffs = dct2_2d(samples, DOWNSAMPLE_SIZE);
    bittify(&coeffs, DOWNSAMPLE_SIZE)
}

/// Same hash, but from a raw luminance plane already sized `32x32` — used by the video
/// decoder facade (C10), which extracts frames straight into a luma buffer without an
/// intermediate `DynamicImage`.
pub fn dct_hash_from_luma32(samples: &[u8]) -> Hamming {
    assert_eq!(samples.len(), DOWNSAMPLE_SIZE * DOWNSAMPLE_SIZE);
    let samples: Vec<f32> = samples.iter().map(|&b| b as f32).collect();
    let coeffs = dct2_2d(samples, DOWNSAMPLE_SIZE);
    bittify(&coeffs, DOWNSAMPLE_SIZE)
}

#[cfg(test)]
mod test {
    use super::*;
    use image::{DynamicImage, Luma};

    #[test]
    fn solid_image_hashes_to_all_zero_ac() {
        // A perfectly flat image has zero AC energy everywhere, so every sign bit should
        // land on the `v > 0.0` false branch.
        let img = DynamicImage::ImageLuma8(image::ImageBuffer::from_pixel(64, 64, Luma([128])));
        let hash = dct_hash(&img);
        assert_eq!(hash.0, 0);
    }

    #[test]
    fn similar_images_hash_close() {
        let a = DynamicImage::ImageLuma8(image::ImageBuffer::from_fn(64, 64, |x, y| {
            Luma([((x + y) % 256) as u8])
        }));
        let b = DynamicImage::ImageLuma8(image::ImageBuffer::from_fn(64, 64, |x, y| {
            Luma([((x + y + 1) % 256) as u8])
        }));
        let ha = dct_hash(&a);
        let hb = dct_hash(&b);
        assert!(ha.distance_to(hb) < 16, "distance was {}", ha.distance_to(hb));
    }

    #[test]
    fn identical_images_hash_identically() {
        let img = DynamicImage::ImageLuma8(image::ImageBuffer::from_fn(64, 64, |x, y| {
            Luma([((x * 3 + y * 7) % 256) as u8])
        }));
        assert_eq!(dct_hash(&img), dct_hash(&img));
    }
}
