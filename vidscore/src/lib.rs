//! vidscore - Video Quality Scoring API
//!
//! Scores a video on three axes: resolution from container metadata, blur
//! as inverse Laplacian variance, motion as the mean dense-optical-flow
//! magnitude between consecutive frames.
//!
//! ```rust,ignore
//! use vidscore::evaluate;
//! use std::path::Path;
//!
//! let report = evaluate(Path::new("clip.mp4"), "Video 1")?;
//! println!("{}x{}", report.width, report.height);
//! ```

pub mod evaluate_api;

// Re-exports
pub use evaluate_api::{evaluate, evaluate_source, QualityReport};

// Shared error types
pub use shared_utils::errors::{Result, VidScoreError};
pub use shared_utils::frame_stream::{FfmpegFrameStream, FrameSource, MemoryFrameSource};
