//! Frame source abstraction over the decoding collaborator.
//!
//! The analysis kernels only need three capabilities from a decoder:
//! dimensions, a sequential "next frame or end-of-stream" read, and release
//! on drop. `FfmpegFrameStream` supplies them by piping packed rgb24 frames
//! out of an ffmpeg child; `MemoryFrameSource` serves callers that already
//! hold decoded frames.

use image::RgbImage;
use std::collections::VecDeque;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

use crate::errors::{Result, VidScoreError};
use crate::ffmpeg_process::FfmpegProcess;
use crate::ffprobe::{is_ffmpeg_available, probe_video, VideoMetadata};

pub trait FrameSource {
    fn dimensions(&self) -> (u32, u32);

    /// Next decoded frame, or `None` at end-of-stream. A read error counts
    /// as end-of-stream: the contract is a single sequential pass with no
    /// retry.
    fn read_frame(&mut self) -> Option<RgbImage>;
}

/// Sequential rgb24 frame stream decoded by an ffmpeg child process.
///
/// ffprobe supplies the stream metadata up front; that probe is also the
/// "can this be opened" check, so a bad source fails here instead of
/// producing a silent empty stream. The child is killed and reaped when the
/// stream is dropped, on every exit path.
pub struct FfmpegFrameStream {
    process: FfmpegProcess,
    stdout: BufReader<std::process::ChildStdout>,
    metadata: VideoMetadata,
    frame_len: usize,
}

impl FfmpegFrameStream {
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = probe_video(path)?;

        if !is_ffmpeg_available() {
            return Err(VidScoreError::ToolNotFound(
                "ffmpeg not found in PATH. Install ffmpeg to decode videos".to_string(),
            ));
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);

        let mut process = FfmpegProcess::spawn(&mut cmd).map_err(|e| {
            VidScoreError::VideoOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        let stdout = process.take_stdout().ok_or_else(|| VidScoreError::VideoOpen {
            path: path.to_path_buf(),
            reason: "FFmpeg stdout not captured".to_string(),
        })?;

        let frame_len = metadata.width as usize * metadata.height as usize * 3;
        debug!(
            width = metadata.width,
            height = metadata.height,
            frame_len,
            "opened rgb24 frame stream"
        );

        Ok(Self {
            process,
            stdout: BufReader::new(stdout),
            metadata,
            frame_len,
        })
    }

    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }
}

impl FrameSource for FfmpegFrameStream {
    fn dimensions(&self) -> (u32, u32) {
        (self.metadata.width, self.metadata.height)
    }

    fn read_frame(&mut self) -> Option<RgbImage> {
        let mut buf = vec![0u8; self.frame_len];
        if let Err(e) = self.stdout.read_exact(&mut buf) {
            // EOF on a frame boundary is the normal end of the stream;
            // anything else is logged and still treated as end-of-stream.
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!(error = %e, "frame read failed, treating as end-of-stream");
            }
            return None;
        }
        RgbImage::from_raw(self.metadata.width, self.metadata.height, buf)
    }
}

impl Drop for FfmpegFrameStream {
    fn drop(&mut self) {
        // FfmpegProcess reaps the child in its own Drop; killing here lets
        // a stream abandoned mid-video shut the decoder down immediately.
        let _ = self.process.kill();
    }
}

/// Frame source over frames already decoded in memory.
pub struct MemoryFrameSource {
    width: u32,
    height: u32,
    frames: VecDeque<RgbImage>,
}

impl MemoryFrameSource {
    pub fn new(width: u32, height: u32, frames: Vec<RgbImage>) -> Self {
        Self {
            width,
            height,
            frames: frames.into(),
        }
    }
}

impl FrameSource for MemoryFrameSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_frame(&mut self) -> Option<RgbImage> {
        self.frames.pop_front()
    }
}
