use indicatif::{ProgressBar, ProgressStyle};
use shared::{Finished, ItemId};

/// Terminal rendering of a running job.
pub struct ProgressView {
    pb: ProgressBar,
}

impl ProgressView {
    pub fn new() -> Self {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} Separating [{bar:40.cyan/blue}] {pos:>3}% {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        Self { pb }
    }

    /// A view that draws nothing.
    pub fn hidden() -> Self {
        Self {
            pb: ProgressBar::hidden(),
        }
    }

    pub fn set_percent(&self, percent: u8) {
        self.pb.set_position(u64::from(percent));
    }

    pub fn percent(&self) -> u8 {
        self.pb.position().min(100) as u8
    }

    pub fn log(&self, line: &str) {
        self.pb.println(line);
    }

    pub fn item_done(&self, item: &ItemId) {
        let name = item
            .path()
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| item.to_string());
        self.pb.set_message(format!("finished {name}"));
    }

    pub fn finish(&self, finished: &Finished) {
        let message = match (&finished.error, finished.cancelled) {
            (Some(_), _) => "failed",
            (None, true) => "cancelled",
            (None, false) => "done",
        };
        if finished.is_success() {
            self.pb.finish_with_message(message);
        } else {
            self.pb.abandon_with_message(message);
        }
    }
}
