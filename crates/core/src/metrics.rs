use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for per-stage throughput and overload accounting.
///
/// # Example
/// ```rust
/// use argus_core::metrics::StageMetrics;
///
/// let metrics = StageMetrics::default();
/// metrics.completed();
/// metrics.dropped();
/// assert_eq!(metrics.completed_count(), 1);
/// assert_eq!(metrics.dropped_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct StageMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl StageMetrics {
    /// Record a buffer submitted to the stage.
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion delivered by the stage.
    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an item rejected by admission control (queue full).
    pub fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a non-fatal per-buffer error.
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of submissions.
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Snapshot of completions.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Snapshot of drops.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of errors.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Submissions not yet completed or dropped.
    pub fn in_flight(&self) -> u64 {
        self.submitted_count()
            .saturating_sub(self.completed_count() + self.dropped_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_accounts_for_drops() {
        let m = StageMetrics::default();
        for _ in 0..5 {
            m.submitted();
        }
        m.completed();
        m.dropped();
        assert_eq!(m.in_flight(), 3);
    }
}
