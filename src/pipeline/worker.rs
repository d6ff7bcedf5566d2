//! Worker: inbound queue → pipeline → shared result sink.

use crate::pipeline::queue::StageReceiver;
use crate::pipeline::{Metrics, Pipeline, PipelineHandle};
use crate::shutdown::Shutdown;
use crate::task::{Sample, Task};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Counters returned when a worker stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker: usize,
    /// Samples handed to the pipeline
    pub accepted: u64,
    /// Tasks handed to the result sink
    pub forwarded: u64,
}

impl std::fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Worker {}: accepted {}, forwarded {}",
            self.worker, self.accepted, self.forwarded
        )
    }
}

/// One dispatch target, owning its inbound queue and its pipeline.
pub struct Worker {
    id: usize,
    inbound: mpsc::Receiver<Sample>,
    pipeline: Pipeline,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(id: usize, inbound: mpsc::Receiver<Sample>, pipeline: Pipeline, metrics: Arc<Metrics>) -> Self {
        Self {
            id,
            inbound,
            pipeline,
            metrics,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run until the inbound queue closes (then drain) or shutdown fires.
    ///
    /// Intake and output forwarding are separate tasks, so a slow pipeline
    /// only holds up intake once the pipeline's own queues are full.
    pub async fn run(mut self, results: mpsc::Sender<Task>, shutdown: Shutdown) -> Result<WorkerStats> {
        let PipelineHandle { entry, exit, stages } =
            self.pipeline.spawn(self.id, self.metrics.clone(), shutdown.clone());

        let forwarder = tokio::spawn(forward(self.id, exit, results, shutdown.clone()));

        let mut accepted = 0u64;
        loop {
            let sample = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sample = self.inbound.recv() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sent = entry.send(Task::new(sample, self.id)) => {
                    if sent.is_err() {
                        tracing::warn!("Worker {} pipeline entry closed", self.id);
                        break;
                    }
                }
            }
            accepted += 1;
        }

        // Closing the entry lets the stages drain in order.
        drop(entry);
        for stage in stages {
            stage.await?;
        }
        let forwarded = forwarder.await?;

        let stats = WorkerStats {
            worker: self.id,
            accepted,
            forwarded,
        };
        tracing::debug!("{}", stats);
        Ok(stats)
    }
}

async fn forward(worker: usize, mut exit: StageReceiver, results: mpsc::Sender<Task>, shutdown: Shutdown) -> u64 {
    let mut forwarded = 0u64;
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task = exit.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = results.send(task) => {
                if sent.is_err() {
                    tracing::debug!("Worker {} result sink closed", worker);
                    break;
                }
            }
        }
        forwarded += 1;
    }
    forwarded
}
