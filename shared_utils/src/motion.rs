//! Sequence motion scoring.
//!
//! One sequential pass over a frame source: dense flow between each
//! consecutive grayscale pair, mean polar magnitude per pair, arithmetic
//! mean over all pairs.

use std::path::Path;
use tracing::debug;

use crate::errors::{Result, VidScoreError};
use crate::frame_stream::{FfmpegFrameStream, FrameSource};
use crate::optical_flow::{farneback_flow, FlowParams};

/// Average motion magnitude of a frame sequence.
///
/// Fails with `EmptyVideo` when the source yields no frame at all, and with
/// `DegenerateMetric` when it yields exactly one (no pair to measure). The
/// source is consumed to exhaustion.
pub fn sequence_motion<S: FrameSource>(source: &mut S) -> Result<f64> {
    let params = FlowParams::default();

    let first = source.read_frame().ok_or(VidScoreError::EmptyVideo)?;
    let mut prev = image::imageops::grayscale(&first);

    let mut magnitudes = Vec::new();
    while let Some(frame) = source.read_frame() {
        let gray = image::imageops::grayscale(&frame);
        let flow = farneback_flow(&prev, &gray, &params);
        magnitudes.push(flow.mean_magnitude());
        prev = gray;
    }

    if magnitudes.is_empty() {
        return Err(VidScoreError::DegenerateMetric(
            "motion requires at least two frames".to_string(),
        ));
    }

    debug!(pairs = magnitudes.len(), "motion pass complete");
    Ok(magnitudes.iter().sum::<f64>() / magnitudes.len() as f64)
}

/// Open a video by path and score its motion. The decoder is released on
/// every exit path, including the early failures.
pub fn score_file(path: &Path) -> Result<f64> {
    let mut stream = FfmpegFrameStream::open(path)?;
    sequence_motion(&mut stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_stream::MemoryFrameSource;
    use image::{Rgb, RgbImage};

    fn solid(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(32, 32, Rgb(color))
    }

    fn textured(offset: u32) -> RgbImage {
        RgbImage::from_fn(48, 48, |x, y| {
            let v = (((x + offset) * 13 + y * 29) % 256) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_identical_frames_score_zero() {
        for n in [2usize, 3, 7] {
            let frames = vec![textured(0); n];
            let mut source = MemoryFrameSource::new(48, 48, frames);
            assert_eq!(sequence_motion(&mut source).unwrap(), 0.0, "n = {}", n);
        }
    }

    #[test]
    fn test_empty_source_is_empty_video() {
        let mut source = MemoryFrameSource::new(32, 32, Vec::new());
        assert!(matches!(
            sequence_motion(&mut source),
            Err(VidScoreError::EmptyVideo)
        ));
    }

    #[test]
    fn test_single_frame_is_degenerate() {
        let mut source = MemoryFrameSource::new(32, 32, vec![solid([9, 9, 9])]);
        assert!(matches!(
            sequence_motion(&mut source),
            Err(VidScoreError::DegenerateMetric(_))
        ));
    }

    #[test]
    fn test_score_file_rejects_unopenable_input() {
        if !crate::ffprobe::is_ffprobe_available() {
            eprintln!("ffprobe not available, skipping");
            return;
        }
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            score_file(file.path()),
            Err(VidScoreError::VideoOpen { .. })
        ));
    }

    #[test]
    fn test_motion_is_nonnegative_and_finite() {
        let frames = vec![solid([0, 0, 0]), solid([255, 255, 255]), solid([0, 0, 0])];
        let mut source = MemoryFrameSource::new(32, 32, frames);
        let motion = sequence_motion(&mut source).unwrap();
        assert!(motion.is_finite());
        assert!(motion >= 0.0);
    }
}
