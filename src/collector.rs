//! Consumer of completed tasks.

use crate::pipeline::Metrics;
use crate::shutdown::Shutdown;
use crate::task::{Task, TaskError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Totals over every task the collector received.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectorSummary {
    pub completed: u64,
    pub verified: u64,
    pub negative_argument: u64,
    pub round_trip_mismatch: u64,
}

impl CollectorSummary {
    pub fn record(&mut self, task: &Task) {
        self.completed += 1;
        match task.error() {
            None => self.verified += 1,
            Some(TaskError::NegativeArgument) => self.negative_argument += 1,
            Some(TaskError::RoundTripMismatch) => self.round_trip_mismatch += 1,
        }
    }

    pub fn failed(&self) -> u64 {
        self.negative_argument + self.round_trip_mismatch
    }
}

impl std::fmt::Display for CollectorSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completed: {}, Verified: {}, Negative argument: {}, Round-trip mismatch: {}",
            self.completed, self.verified, self.negative_argument, self.round_trip_mismatch
        )
    }
}

/// Drains the shared result sink.
pub struct Collector {
    metrics: Arc<Metrics>,
}

impl Collector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// Receive until every worker has dropped its sender or shutdown fires.
    pub async fn run(self, mut results: mpsc::Receiver<Task>, shutdown: Shutdown) -> CollectorSummary {
        let mut summary = CollectorSummary::default();

        loop {
            let task = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                task = results.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            match task.error() {
                None => tracing::debug!(
                    "Worker {} verified {:.4} (sqrt {:.4}, square {:.4})",
                    task.worker(),
                    task.source(),
                    task.intermediate().unwrap_or(f64::NAN),
                    task.result().unwrap_or(f64::NAN)
                ),
                Some(error) => tracing::debug!(
                    "Worker {} rejected {:.4}: {}",
                    task.worker(),
                    task.source(),
                    error
                ),
            }

            self.metrics.add_task_completed(task.error());
            summary.record(&task);
        }

        tracing::info!("Collector stopped. {}", summary);
        summary
    }
}
