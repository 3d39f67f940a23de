//! FFprobe wrapper module
//!
//! Container probing for the evaluator: resolution, frame rate and frame
//! count read from stream metadata. Probing doubles as the "can this source
//! be opened" check; a source ffprobe rejects is reported as `VideoOpen`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::errors::{Result, VidScoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub frame_rate: f64,
    /// Frame count from `nb_frames`, estimated from duration when absent.
    pub frame_count: u64,
    pub codec: String,
    pub pix_fmt: String,
}

pub fn is_ffprobe_available() -> bool {
    which::which("ffprobe").is_ok()
}

pub fn is_ffmpeg_available() -> bool {
    which::which("ffmpeg").is_ok()
}

pub fn probe_video(path: &Path) -> Result<VideoMetadata> {
    if !is_ffprobe_available() {
        return Err(VidScoreError::ToolNotFound(
            "ffprobe not found in PATH. Install ffmpeg to analyze videos".to_string(),
        ));
    }

    let path_str = path.to_str().ok_or_else(|| {
        VidScoreError::Ffprobe(format!("Invalid path encoding: {}", path.display()))
    })?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "--",
            path_str,
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = if stderr.trim().is_empty() {
            format!("ffprobe exit code {:?}", output.status.code())
        } else {
            stderr.trim().to_string()
        };
        return Err(VidScoreError::VideoOpen {
            path: path.to_path_buf(),
            reason,
        });
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    debug!(path = %path.display(), "parsing ffprobe output");

    parse_probe_output(&json_str).map_err(|e| match e {
        VidScoreError::Ffprobe(msg) if msg.contains("No video stream") => {
            VidScoreError::VideoOpen {
                path: path.to_path_buf(),
                reason: msg,
            }
        }
        other => other,
    })
}

/// Parse an ffprobe `-print_format json` document. Split out of
/// [`probe_video`] so it can be exercised without spawning ffprobe.
pub fn parse_probe_output(json_str: &str) -> Result<VideoMetadata> {
    let json: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| VidScoreError::Ffprobe(e.to_string()))?;

    let format = &json["format"];
    let duration = format["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let streams = json["streams"]
        .as_array()
        .ok_or_else(|| VidScoreError::Ffprobe("No streams found".to_string()))?;

    let video_stream = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| VidScoreError::Ffprobe("No video stream found".to_string()))?;

    let width = video_stream["width"].as_u64().unwrap_or(0) as u32;
    let height = video_stream["height"].as_u64().unwrap_or(0) as u32;
    if width == 0 || height == 0 {
        return Err(VidScoreError::Ffprobe(format!(
            "Video stream reports degenerate resolution {}x{}",
            width, height
        )));
    }

    let frame_rate = parse_frame_rate(video_stream["r_frame_rate"].as_str().unwrap_or("0/1"));

    let frame_count = video_stream["nb_frames"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or((duration * frame_rate) as u64);

    let codec = video_stream["codec_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let pix_fmt = video_stream["pix_fmt"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    Ok(VideoMetadata {
        width,
        height,
        duration,
        frame_rate,
        frame_count,
        codec,
        pix_fmt,
    })
}

fn parse_frame_rate(rate: &str) -> f64 {
    let parts: Vec<&str> = rate.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().unwrap_or(0.0);
        let den: f64 = parts[1].parse().unwrap_or(1.0);
        if den > 0.0 {
            return num / den;
        }
    }
    rate.parse().unwrap_or(0.0)
}
