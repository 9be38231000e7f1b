//! Terminal progress bar fed from batch snapshots.

use std::fmt::Write as _;
use std::time::Duration;

use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use mediagrab_core::{BatchHandle, BatchSnapshot};

/// Progress bar over a batch's task count. Hidden when disabled.
pub(crate) struct BatchProgressBar {
    bar: ProgressBar,
}

impl BatchProgressBar {
    pub(crate) fn new(enabled: bool, total: usize) -> Self {
        if !enabled {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub(crate) fn update(&self, snapshot: &BatchSnapshot) {
        self.bar.set_position(snapshot.finished() as u64);
        self.bar.set_message(describe(snapshot));
    }

    /// Polls `handle` until every task is terminal.
    pub(crate) async fn follow(&self, handle: &BatchHandle, interval: Duration) {
        while !handle.is_finished() {
            self.update(&handle.progress());
            tokio::time::sleep(interval).await;
        }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn describe(snapshot: &BatchSnapshot) -> String {
    let progress = &snapshot.progress;
    let mut msg = HumanBytes(progress.bytes_done).to_string();
    if let Some(expected) = progress.bytes_expected {
        let _ = write!(msg, " / {}", HumanBytes(expected));
    }
    if progress.speed_bps >= 1.0 {
        let _ = write!(msg, " at {}/s", HumanBytes(progress.speed_bps as u64));
    }
    if let Some(eta) = progress.eta {
        let _ = write!(msg, ", eta {}", HumanDuration(eta));
    }
    if snapshot.counts.failed > 0 {
        let _ = write!(msg, ", {} failed", snapshot.counts.failed);
    }
    msg
}
