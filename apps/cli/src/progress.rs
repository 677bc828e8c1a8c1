//! Progress bar utilities for CLI downloads

use bundlefetch_types::{CoreEvent, DownloadStatus};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

/// Manages one progress bar per downloading key
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    hidden: bool,
}

impl DownloadProgress {
    pub fn new(hidden: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            hidden,
        }
    }

    fn bar(&mut self, key: &str, total: u64) -> &ProgressBar {
        let multi = &self.multi;
        let hidden = self.hidden;
        self.bars.entry(key.to_string()).or_insert_with(|| {
            let pb = if hidden {
                ProgressBar::hidden()
            } else {
                multi.add(ProgressBar::new(total))
            };
            if let Ok(bar_style) = ProgressStyle::default_bar().template(
                "{spinner:.green} {msg:12} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            ) {
                pb.set_style(bar_style.progress_chars("█▓▒░  "));
            }
            pb.set_message(key.to_string());
            pb
        })
    }

    /// Update bars from a core event
    pub fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::DownloadProgress {
                key,
                downloaded,
                total,
                ..
            } => {
                let pb = self.bar(key, *total);
                pb.set_length(*total);
                pb.set_position(*downloaded);
            }

            CoreEvent::DownloadStatusChanged { key, status, .. } => {
                let Some(pb) = self.bars.get(key) else {
                    return;
                };
                match status {
                    DownloadStatus::Succeeded => {
                        pb.finish_with_message(format!("{} {}", style("✓").green().bold(), key));
                    }
                    DownloadStatus::Failed { message } => {
                        pb.abandon_with_message(format!(
                            "{} {}: {}",
                            style("✗").red().bold(),
                            key,
                            message
                        ));
                    }
                    DownloadStatus::Ongoing { .. } => {}
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}
