//! Throughput monitoring and metrics collection.

use crate::pipeline::LoadSnapshot;
use crate::task::TaskError;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the fabric.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Samples emitted by all sources
    pub samples_generated: AtomicU64,

    /// Samples admitted into a worker queue
    pub samples_dispatched: AtomicU64,

    /// Samples dropped by the dispatcher
    pub samples_dropped: AtomicU64,

    /// Tasks that reached the collector
    pub tasks_completed: AtomicU64,

    /// Completed tasks without an error
    pub tasks_verified: AtomicU64,

    /// Completed tasks with "negative argument"
    pub negative_argument: AtomicU64,

    /// Completed tasks with "round-trip mismatch"
    pub round_trip_mismatch: AtomicU64,

    /// Time spent inside stage `process` calls (microseconds)
    pub stage_us: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_sample_generated(&self) {
        self.samples_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sample_dispatched(&self) {
        self.samples_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task leaving the fabric, with its error if any.
    pub fn add_task_completed(&self, error: Option<TaskError>) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let counter = match error {
            None => &self.tasks_verified,
            Some(TaskError::NegativeArgument) => &self.negative_argument,
            Some(TaskError::RoundTripMismatch) => &self.round_trip_mismatch,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in a stage (in microseconds).
    pub fn add_stage_time(&self, duration: Duration) {
        self.stage_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Completed tasks per second.
    pub fn tasks_per_second(&self) -> f64 {
        let tasks = self.tasks_completed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            tasks as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_generated: self.samples_generated.load(Ordering::Relaxed),
            samples_dispatched: self.samples_dispatched.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_verified: self.tasks_verified.load(Ordering::Relaxed),
            negative_argument: self.negative_argument.load(Ordering::Relaxed),
            round_trip_mismatch: self.round_trip_mismatch.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tasks_per_second: self.tasks_per_second(),
            stage_secs: self.stage_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub samples_generated: u64,
    pub samples_dispatched: u64,
    pub samples_dropped: u64,
    pub tasks_completed: u64,
    pub tasks_verified: u64,
    pub negative_argument: u64,
    pub round_trip_mismatch: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub tasks_per_second: f64,
    /// Total time spent in stages (seconds, summed across stage tasks)
    pub stage_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Percentage of offered samples that were dropped.
    pub fn drop_rate(&self) -> f64 {
        let offered = self.samples_dispatched + self.samples_dropped;
        if offered > 0 {
            self.samples_dropped as f64 / offered as f64 * 100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Samples: {} generated, {} dispatched, {} dropped ({:.1}%) | \
             Tasks: {} completed, {} verified, {} negative, {} mismatch | \
             Rate: {:.1} tasks/s | Elapsed: {:.1}s",
            self.samples_generated,
            self.samples_dispatched,
            self.samples_dropped,
            self.drop_rate(),
            self.tasks_completed,
            self.tasks_verified,
            self.negative_argument,
            self.round_trip_mismatch,
            self.tasks_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    load: Option<watch::Receiver<LoadSnapshot>>,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            load: None,
        }
    }

    /// Also report the dispatcher's latest load distribution.
    pub fn with_load(mut self, load: watch::Receiver<LoadSnapshot>) -> Self {
        self.load = Some(load);
        self
    }

    fn load_line(&self) -> String {
        self.load
            .as_ref()
            .map(|rx| rx.borrow().to_string())
            .unwrap_or_default()
    }

    /// Start the periodic reporter. Hands itself back once stopped.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Self {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{} | {}", self.metrics.snapshot(), self.load_line());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
        self
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Fabric Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Samples generated: {}", snapshot.samples_generated);
        println!("Samples dispatched: {}", snapshot.samples_dispatched);
        println!(
            "Samples dropped: {} ({:.1}%)",
            snapshot.samples_dropped,
            snapshot.drop_rate()
        );
        println!("Tasks completed: {}", snapshot.tasks_completed);
        println!("  verified: {}", snapshot.tasks_verified);
        println!("  negative argument: {}", snapshot.negative_argument);
        println!("  round-trip mismatch: {}", snapshot.round_trip_mismatch);
        println!("Processing rate: {:.1} tasks/s", snapshot.tasks_per_second);
        println!("Stage time: {:.3}s", snapshot.stage_secs);

        if let Some(load) = &self.load {
            let load = load.borrow();
            if load.total > 0 {
                println!("\n--- Load Distribution ---");
                for (worker, share) in load.shares.iter().enumerate() {
                    println!("Worker {:>3}: {:>5.1}%", worker, share);
                }
            }
        }
        println!("======================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_sample_generated();
        metrics.add_sample_generated();
        metrics.add_sample_dispatched();
        metrics.add_sample_dropped();

        assert_eq!(metrics.samples_generated.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.samples_dispatched.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.samples_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_task_completion_by_kind() {
        let metrics = Metrics::new();

        metrics.add_task_completed(None);
        metrics.add_task_completed(None);
        metrics.add_task_completed(Some(TaskError::NegativeArgument));
        metrics.add_task_completed(Some(TaskError::RoundTripMismatch));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_completed, 4);
        assert_eq!(snapshot.tasks_verified, 2);
        assert_eq!(snapshot.negative_argument, 1);
        assert_eq!(snapshot.round_trip_mismatch, 1);
    }

    #[test]
    fn test_stage_time() {
        let metrics = Metrics::new();
        metrics.add_stage_time(Duration::from_millis(100));
        metrics.add_stage_time(Duration::from_millis(50));
        assert!((metrics.snapshot().stage_secs - 0.15).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            samples_generated: 110,
            samples_dispatched: 100,
            samples_dropped: 10,
            tasks_completed: 100,
            tasks_verified: 60,
            negative_argument: 40,
            round_trip_mismatch: 0,
            elapsed: Duration::from_secs(10),
            tasks_per_second: 10.0,
            stage_secs: 0.5,
        };

        let display = format!("{}", snapshot);
        assert!(display.contains("100 dispatched"));
        assert!(display.contains("10 dropped (9.1%)"));
        assert!(display.contains("40 negative"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_task_completed(None);
        assert_eq!(metrics.tasks_per_second(), 0.0);
        assert_eq!(metrics.snapshot().drop_rate(), 0.0);
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let path = path.to_str().unwrap();

        let metrics = Metrics::new();
        metrics.add_sample_dropped();
        metrics.snapshot().save_to_file(path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["samples_dropped"], 1);
    }

    #[test]
    fn test_metrics_reporter_new() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 10);
        assert_eq!(reporter.interval_secs, 10);
        assert!(reporter.load_line().is_empty());
    }

    #[tokio::test]
    async fn test_reporter_hands_itself_back_on_stop() {
        let metrics = Metrics::new();
        let (load_tx, load_rx) = watch::channel(LoadSnapshot::default());
        let reporter = MetricsReporter::new(metrics.clone(), 3600).with_load(load_rx);

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).await.unwrap();
        let reporter = handle.await.unwrap();

        metrics.add_sample_dispatched();
        load_tx.send_replace(LoadSnapshot {
            total: 1,
            shares: vec![100.0],
        });
        assert_eq!(reporter.interval_secs, 3600);
        assert!(reporter.load_line().contains("w0=100.0%"));
        reporter.print_summary();
    }
}
