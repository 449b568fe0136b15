use std::time::Instant;

use tracing::info;

/// Tracks progress of a long-running operation and periodically logs
/// current/total, elapsed time, and an ETA.
///
/// Ported from the polling loop's `ProgressTracker`, with `logger.info`
/// calls replaced by `tracing::info!` spans carrying structured fields
/// instead of pre-formatted strings.
pub struct ProgressTracker {
    operation_name: String,
    total: u64,
    current: u64,
    log_interval_pct: u64,
    last_logged_pct: u64,
    started_at: Instant,
}

impl ProgressTracker {
    pub fn new(operation_name: impl Into<String>, total: u64) -> Self {
        Self::with_log_interval(operation_name, total, 10)
    }

    pub fn with_log_interval(operation_name: impl Into<String>, total: u64, log_interval_pct: u64) -> Self {
        Self {
            operation_name: operation_name.into(),
            total,
            current: 0,
            log_interval_pct: log_interval_pct.max(1),
            last_logged_pct: 0,
            started_at: Instant::now(),
        }
    }

    fn percent_complete(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            (self.current * 100) / self.total
        }
    }

    /// Advances the counter by `n` and logs if a new interval boundary was crossed.
    pub fn update(&mut self, n: u64) {
        self.current += n;
        let pct = self.percent_complete();
        if pct >= self.last_logged_pct + self.log_interval_pct || self.current >= self.total {
            self.last_logged_pct = pct - (pct % self.log_interval_pct);
            let elapsed = self.started_at.elapsed();
            let remaining = self.total.saturating_sub(self.current);
            let eta_secs = if self.current > 0 {
                (elapsed.as_secs_f64() / self.current as f64) * remaining as f64
            } else {
                0.0
            };
            info!(
                operation = self.operation_name.as_str(),
                current = self.current,
                total = self.total,
                percent = pct,
                elapsed_secs = elapsed.as_secs_f64(),
                eta_secs,
                "progress"
            );
        }
    }

    /// Logs total elapsed time and mean per-item cost.
    pub fn complete(&self) {
        let elapsed = self.started_at.elapsed();
        let per_item = if self.current > 0 {
            elapsed.as_secs_f64() / self.current as f64
        } else {
            0.0
        };
        info!(
            operation = self.operation_name.as_str(),
            total = self.current,
            elapsed_secs = elapsed.as_secs_f64(),
            per_item_secs = per_item,
            "operation complete"
        );
    }

    pub fn current(&self) -> u64 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_complete_handles_zero_total() {
        let tracker = ProgressTracker::new("noop", 0);
        assert_eq!(tracker.percent_complete(), 100);
    }

    #[test]
    fn update_advances_current() {
        let mut tracker = ProgressTracker::new("import", 10);
        tracker.update(3);
        assert_eq!(tracker.current(), 3);
        tracker.update(7);
        assert_eq!(tracker.current(), 10);
    }

    #[test]
    fn crossing_interval_does_not_panic_or_double_count() {
        let mut tracker = ProgressTracker::with_log_interval("import", 100, 10);
        for _ in 0..10 {
            tracker.update(10);
        }
        assert_eq!(tracker.current(), 100);
    }
}
