//! Frame progress reporting.
//!
//! A full decode-and-analyze pass over a long video can take minutes; the
//! bar keeps the terminal alive. Frame counts from container metadata are
//! advisory, so an unknown or wrong total degrades to a spinner/overrun
//! rather than an error.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub fn frame_progress(total_frames: Option<u64>, label: &str) -> ProgressBar {
    let bar = match total_frames {
        Some(total) if total > 0 => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix:12} [{bar:32}] {pos}/{len} frames | {elapsed_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
            );
            bar
        }
        _ => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{prefix:12} {spinner} {pos} frames | {elapsed_precise}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        }
    };
    bar.set_prefix(label.to_string());
    bar
}
