//! Progress bar for a running transfer

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use transfers_types::{TaskStatus, TransferTask};

/// Byte progress of one transfer, summed over its parent tasks
pub struct TransferProgress {
    progress_bar: Option<ProgressBar>,
}

impl TransferProgress {
    /// Create a tracker. A quiet tracker draws nothing.
    pub fn new(quiet: bool) -> Self {
        let progress_bar = (!quiet).then(|| {
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} {msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            ) {
                pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        });
        Self { progress_bar }
    }

    /// Refresh from the latest task snapshot
    pub fn update(&self, task: &TransferTask) {
        let Some(pb) = &self.progress_bar else {
            return;
        };
        let (done, total) = totals(task);
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(describe(task));
    }

    /// Stop drawing, leaving the last state on screen
    pub fn finish(&self, task: &TransferTask) {
        if let Some(pb) = &self.progress_bar {
            self.update(task);
            pb.finish_with_message(task.status.to_string());
        }
    }
}

/// Bytes transferred and expected over all parents
pub fn totals(task: &TransferTask) -> (u64, u64) {
    task.parent_tasks.iter().fold((0, 0), |(done, total), parent| {
        (
            done + parent.bytes_transferred,
            total + parent.total_bytes,
        )
    })
}

fn describe(task: &TransferTask) -> String {
    let finished = task
        .parent_tasks
        .iter()
        .filter(|parent| parent.is_terminal())
        .count();
    match task.status {
        TaskStatus::Accepted | TaskStatus::Staging => format!("{} (staging)", task.status),
        _ => format!(
            "{} ({finished}/{} elements)",
            task.status,
            task.parent_tasks.len()
        ),
    }
}
