//! Video quality evaluation API.
//!
//! One evaluation is one fused sequential pass over the decoded frames:
//! every frame contributes a blur score, every consecutive pair contributes
//! a motion magnitude. The original two-traversal formulation (blur pass,
//! then a second decode for motion) doubles the decode cost for no gain, so
//! both metrics ride the same pass here.

use image::GrayImage;
use indicatif::ProgressBar;
use serde::Serialize;
use std::path::Path;
use tracing::info;

use shared_utils::blur::blur_score;
use shared_utils::errors::{Result, VidScoreError};
use shared_utils::frame_stream::{FfmpegFrameStream, FrameSource};
use shared_utils::optical_flow::{farneback_flow, FlowParams};
use shared_utils::progress::frame_progress;

/// Per-video result record. Immutable once built; owned by the caller.
///
/// Non-finite averages (an all-uniform video has `+inf` blur) serialize as
/// JSON `null`; the human formatter renders them as text.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub average_blur: f64,
    pub average_motion: f64,
}

/// Evaluate a video file: open, read metadata, score blur and motion.
///
/// Every failure is a typed error at this boundary — an unopenable file,
/// an empty stream, a one-frame stream — never a process abort, so two
/// side-by-side evaluations stay independent.
pub fn evaluate(path: &Path, label: &str) -> Result<QualityReport> {
    let mut stream = FfmpegFrameStream::open(path)?;
    let frame_count = stream.metadata().frame_count;
    info!(
        path = %path.display(),
        label,
        frames = frame_count,
        "starting evaluation"
    );

    let bar = frame_progress(Some(frame_count).filter(|c| *c > 0), label);
    let result = evaluate_source(&mut Counted::new(&mut stream, &bar), label);
    bar.finish_and_clear();
    result
}

/// Fused blur+motion pass over any frame source. Resolution is taken from
/// the source itself.
pub fn evaluate_source<S: FrameSource>(source: &mut S, label: &str) -> Result<QualityReport> {
    let (width, height) = source.dimensions();
    let params = FlowParams::default();

    let mut blur_values = Vec::new();
    let mut motion_values = Vec::new();
    let mut prev_gray: Option<GrayImage> = None;

    while let Some(frame) = source.read_frame() {
        blur_values.push(blur_score(&frame));

        let gray = image::imageops::grayscale(&frame);
        if let Some(prev) = prev_gray.as_ref() {
            motion_values.push(farneback_flow(prev, &gray, &params).mean_magnitude());
        }
        prev_gray = Some(gray);
    }

    if blur_values.is_empty() {
        return Err(VidScoreError::EmptyVideo);
    }
    if motion_values.is_empty() {
        return Err(VidScoreError::DegenerateMetric(
            "motion requires at least two frames".to_string(),
        ));
    }

    let report = QualityReport {
        label: label.to_string(),
        width,
        height,
        average_blur: mean(&blur_values),
        average_motion: mean(&motion_values),
    };
    info!(
        label,
        frames = blur_values.len(),
        average_blur = report.average_blur,
        average_motion = report.average_motion,
        "evaluation complete"
    );
    Ok(report)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Frame source adapter that ticks a progress bar per decoded frame.
struct Counted<'a, S> {
    inner: &'a mut S,
    bar: &'a ProgressBar,
}

impl<'a, S> Counted<'a, S> {
    fn new(inner: &'a mut S, bar: &'a ProgressBar) -> Self {
        Self { inner, bar }
    }
}

impl<S: FrameSource> FrameSource for Counted<'_, S> {
    fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    fn read_frame(&mut self) -> Option<image::RgbImage> {
        let frame = self.inner.read_frame();
        if frame.is_some() {
            self.bar.inc(1);
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use shared_utils::frame_stream::MemoryFrameSource;

    fn solid(w: u32, h: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(color))
    }

    fn textured(w: u32, h: u32, seed: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = ((x * 31 + y * 17 + seed * 101) % 256) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_alternating_solid_colors_end_to_end() {
        // 10 frames, 64x48, flipping between two solid colors. Every frame
        // is uniform, so blur is infinite; a uniform pair carries no
        // gradients, so the flow field is exactly zero and the motion
        // average stays finite and non-negative.
        let frames: Vec<RgbImage> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    solid(64, 48, [255, 0, 0])
                } else {
                    solid(64, 48, [0, 0, 255])
                }
            })
            .collect();
        let mut source = MemoryFrameSource::new(64, 48, frames);

        let report = evaluate_source(&mut source, "alternating").unwrap();
        assert_eq!(report.width, 64);
        assert_eq!(report.height, 48);
        assert!(report.average_blur.is_infinite());
        assert!(report.average_blur > 0.0);
        assert!(report.average_motion.is_finite());
        assert!(report.average_motion >= 0.0);
    }

    #[test]
    fn test_textured_video_has_finite_scores() {
        let frames: Vec<RgbImage> = (0..4).map(|i| textured(48, 48, i)).collect();
        let mut source = MemoryFrameSource::new(48, 48, frames);

        let report = evaluate_source(&mut source, "textured").unwrap();
        assert!(report.average_blur.is_finite());
        assert!(report.average_blur > 0.0);
        assert!(report.average_motion.is_finite());
        assert!(report.average_motion >= 0.0);
    }

    #[test]
    fn test_zero_frames_is_empty_video() {
        let mut source = MemoryFrameSource::new(32, 32, Vec::new());
        assert!(matches!(
            evaluate_source(&mut source, "empty"),
            Err(VidScoreError::EmptyVideo)
        ));
    }

    #[test]
    fn test_single_frame_is_degenerate() {
        let mut source = MemoryFrameSource::new(32, 32, vec![textured(32, 32, 0)]);
        assert!(matches!(
            evaluate_source(&mut source, "single"),
            Err(VidScoreError::DegenerateMetric(_))
        ));
    }

    #[test]
    fn test_infinite_blur_serializes_as_null() {
        let report = QualityReport {
            label: "x".to_string(),
            width: 4,
            height: 4,
            average_blur: f64::INFINITY,
            average_motion: 0.25,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["average_blur"].is_null());
        assert_eq!(json["average_motion"], 0.25);
    }

    #[test]
    fn test_unopenable_file_is_video_open_error() {
        if !shared_utils::is_ffprobe_available() {
            eprintln!("ffprobe not available, skipping");
            return;
        }
        let file = tempfile::NamedTempFile::new().unwrap();
        // Zero bytes: no demuxer will take it.
        let result = evaluate(file.path(), "broken");
        assert!(matches!(result, Err(VidScoreError::VideoOpen { .. })));
    }
}
