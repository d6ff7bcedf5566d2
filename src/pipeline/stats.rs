//! Per-worker dispatch counters and the load distribution derived from them.

use serde::Serialize;

/// Dispatch counters, one per worker, sized once at construction.
///
/// Owned by the dispatcher; the sum of all counters always equals the number
/// of successful dispatches.
#[derive(Debug, Clone)]
pub struct LoadStats {
    counts: Box<[u64]>,
    total: u64,
}

impl LoadStats {
    pub fn new(worker_count: usize) -> Self {
        Self {
            counts: vec![0; worker_count].into_boxed_slice(),
            total: 0,
        }
    }

    /// Count one dispatch to `worker`.
    ///
    /// # Panics
    ///
    /// If `worker` is not below the worker count given at construction.
    pub fn record(&mut self, worker: usize) {
        self.counts[worker] += 1;
        self.total += 1;
    }

    pub fn worker_count(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Share of all dispatches per worker, in percent.
    pub fn snapshot(&self) -> LoadSnapshot {
        let shares = if self.total == 0 {
            vec![0.0; self.counts.len()]
        } else {
            self.counts
                .iter()
                .map(|&count| count as f64 / self.total as f64 * 100.0)
                .collect()
        };

        LoadSnapshot {
            total: self.total,
            shares,
        }
    }
}

/// Load distribution at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    /// Successful dispatches so far
    pub total: u64,

    /// Percentage of `total` that went to each worker
    pub shares: Vec<f64>,
}

impl std::fmt::Display for LoadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Load ({} dispatched):", self.total)?;
        for (worker, share) in self.shares.iter().enumerate() {
            write!(f, " w{}={:.1}%", worker, share)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_is_all_zero() {
        let stats = LoadStats::new(4);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.shares, vec![0.0; 4]);
    }

    #[test]
    fn test_record_and_snapshot() {
        let mut stats = LoadStats::new(3);
        stats.record(0);
        stats.record(0);
        stats.record(2);
        stats.record(1);

        assert_eq!(stats.counts(), &[2, 1, 1]);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.counts().iter().sum::<u64>(), stats.total());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.shares, vec![50.0, 25.0, 25.0]);
    }

    #[test]
    fn test_shares_sum_to_hundred() {
        let mut stats = LoadStats::new(7);
        for i in 0..1000 {
            stats.record(i % 7);
        }
        let sum: f64 = stats.snapshot().shares.iter().sum();
        assert!((sum - 100.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic]
    fn test_record_out_of_range_panics() {
        let mut stats = LoadStats::new(2);
        stats.record(2);
    }

    #[test]
    fn test_snapshot_display() {
        let mut stats = LoadStats::new(2);
        stats.record(0);
        stats.record(1);
        let display = format!("{}", stats.snapshot());
        assert!(display.contains("2 dispatched"));
        assert!(display.contains("w0=50.0%"));
        assert!(display.contains("w1=50.0%"));
    }
}
