use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

/// Receives byte counts as a transfer runs. Parts may complete on several
/// threads, so both calls take `&self`.
pub trait ProgressTracker: Send + Sync {
    fn set_total(&self, total: u64);
    fn advance(&self, bytes: u64);
}

/// Builds one tracker per labelled transfer.
pub trait ProgressFactory: Send + Sync {
    fn tracker(&self, label: &str) -> Arc<dyn ProgressTracker>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressTracker for NoProgress {
    fn set_total(&self, _total: u64) {}

    fn advance(&self, _bytes: u64) {}
}

impl ProgressFactory for NoProgress {
    fn tracker(&self, _label: &str) -> Arc<dyn ProgressTracker> {
        Arc::new(NoProgress)
    }
}

/// Emits `tracing` events, logging at info level each time another tenth
/// of the total completes.
#[derive(Debug)]
pub struct LogProgress {
    label: String,
    total: AtomicU64,
    done: AtomicU64,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

impl ProgressTracker for LogProgress {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        debug!(label = %self.label, total, "transfer started");
    }

    fn advance(&self, bytes: u64) {
        let before = self.done.fetch_add(bytes, Ordering::Relaxed);
        let after = before + bytes;
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return;
        }
        if after * 10 / total != before * 10 / total {
            info!(
                label = %self.label,
                done = after,
                total,
                percent = after * 100 / total,
                "transfer progress"
            );
        }
    }
}

/// Hands out a fresh `LogProgress` for each label.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressFactory;

impl ProgressFactory for LogProgressFactory {
    fn tracker(&self, label: &str) -> Arc<dyn ProgressTracker> {
        Arc::new(LogProgress::new(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_progress_accumulates_out_of_order_parts() {
        let progress = LogProgress::new("reads.fastq");
        progress.set_total(12);
        progress.advance(2);
        progress.advance(5);
        progress.advance(5);
        assert_eq!(progress.done(), 12);
    }
}
