//! Frame blur scoring.
//!
//! Sharpness proxy: variance of the discrete Laplacian response over the
//! grayscale frame. Sharp, high-detail frames produce high variance; flat,
//! blurry frames produce low variance. The score inverts that relationship
//! so larger means blurrier.

use image::{GrayImage, RgbImage};
use rayon::prelude::*;

/// Fixed inversion scale. Scores are only comparable across runs if this
/// constant never changes.
pub const BLUR_SCALE: f64 = 1000.0;

/// Blur score of a single decoded frame: `1000 / laplacian_variance`,
/// `+inf` for a perfectly uniform frame (zero variance).
pub fn blur_score(frame: &RgbImage) -> f64 {
    let gray = image::imageops::grayscale(frame);
    let response = laplacian_response(&gray);
    let variance = population_variance(&response);

    // Uniform frame: no edges at all. Defined as infinitely blurry rather
    // than a division error.
    if variance == 0.0 {
        return f64::INFINITY;
    }

    BLUR_SCALE / variance
}

/// Per-pixel response of the 4-neighbour Laplacian kernel
/// `[0 1 0; 1 -4 1; 0 1 0]`, replicated borders.
fn laplacian_response(gray: &GrayImage) -> Vec<f64> {
    let (w, h) = gray.dimensions();
    let (wi, hi) = (w as i64, h as i64);

    let sample = |x: i64, y: i64| -> f64 {
        let x = x.clamp(0, wi - 1) as u32;
        let y = y.clamp(0, hi - 1) as u32;
        gray.get_pixel(x, y).0[0] as f64
    };

    (0..hi)
        .into_par_iter()
        .flat_map_iter(|y| {
            (0..wi)
                .map(|x| {
                    sample(x - 1, y) + sample(x + 1, y) + sample(x, y - 1) + sample(x, y + 1)
                        - 4.0 * sample(x, y)
                })
                .collect::<Vec<f64>>()
        })
        .collect()
}

fn population_variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.par_iter().sum::<f64>() / n;
    values.par_iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use proptest::prelude::*;

    #[test]
    fn test_uniform_frame_is_infinitely_blurry() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([37, 120, 200]));
        assert!(blur_score(&frame).is_infinite());
        assert!(blur_score(&frame) > 0.0);
    }

    #[test]
    fn test_step_edge_scores_below_uniform() {
        // Half black, half white: a single hard edge.
        let frame = RgbImage::from_fn(64, 48, |x, _| {
            if x < 32 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let score = blur_score(&frame);
        assert!(score.is_finite());
        assert!(score > 0.0);
        assert!(score < blur_score(&RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]))));
    }

    #[test]
    fn test_sharper_content_scores_lower() {
        // Checkerboard is all edges; a slow horizontal ramp is nearly flat.
        let checker = RgbImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let ramp = RgbImage::from_fn(64, 64, |x, _| {
            let v = (x * 255 / 63) as u8;
            Rgb([v, v, v])
        });
        assert!(blur_score(&checker) < blur_score(&ramp));
    }

    #[test]
    fn test_score_depends_only_on_luminance() {
        // R and B carry equal values, so swapping them preserves luminance
        // exactly.
        let original = RgbImage::from_fn(32, 32, |x, y| {
            let a = ((x * 7 + y * 13) % 256) as u8;
            let g = ((x * 3 + y * 5) % 256) as u8;
            Rgb([a, g, a])
        });
        let swapped = RgbImage::from_fn(32, 32, |x, y| {
            let p = original.get_pixel(x, y).0;
            Rgb([p[2], p[1], p[0]])
        });
        assert_eq!(blur_score(&original), blur_score(&swapped));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_score_is_positive(seed in any::<u32>(), w in 4u32..32, h in 4u32..32) {
            let frame = RgbImage::from_fn(w, h, |x, y| {
                let v = seed
                    .wrapping_mul(2654435761)
                    .wrapping_add(x * 31 + y * 17)
                    .wrapping_mul(2246822519);
                Rgb([(v >> 8) as u8, (v >> 16) as u8, (v >> 24) as u8])
            });
            let score = blur_score(&frame);
            prop_assert!(score > 0.0);
        }
    }
}
