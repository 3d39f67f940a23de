use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VidScoreError {
    #[error("Failed to open video {path}: {reason}")]
    VideoOpen { path: PathBuf, reason: String },

    #[error("Video stream produced no decodable frames")]
    EmptyVideo,

    #[error("Metric is undefined: {0}")]
    DegenerateMetric(String),

    #[error("FFprobe failed: {0}")]
    Ffprobe(String),

    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VidScoreError>;
