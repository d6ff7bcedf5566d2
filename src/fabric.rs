//! Wiring of sources, dispatcher, workers and collector.
//!
//! ```text
//! Source 0 ─┐                       ┌─▶ Worker 0 [stage 0 → 1 → 2] ─┐
//! Source 1 ─┼─▶ Dispatcher (random ─┼─▶ Worker 1 [stage 0 → 1 → 2] ─┼─▶ Collector
//! Source n ─┘   among eligible)     └─▶ Worker m [stage 0 → 1 → 2] ─┘
//! ```
//!
//! With finite sources the fabric drains on its own: each component exits
//! once its input closes, which closes its output in turn.

use crate::collector::{Collector, CollectorSummary};
use crate::config::Config;
use crate::pipeline::{
    DispatchStats, Dispatcher, LoadSnapshot, Metrics, Pipeline, Worker, WorkerQueue, WorkerStats,
};
use crate::shutdown::Shutdown;
use crate::source::SourceSet;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Everything the fabric reports once joined.
#[derive(Debug, Clone, Default)]
pub struct FabricStats {
    /// Samples emitted by the sources
    pub generated: u64,
    pub dispatch: DispatchStats,
    pub workers: Vec<WorkerStats>,
    pub collector: CollectorSummary,
}

impl std::fmt::Display for FabricStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Generated: {} | {} | {}",
            self.generated, self.dispatch, self.collector
        )
    }
}

/// A running fabric.
pub struct Fabric {
    sources: Vec<JoinHandle<u64>>,
    dispatcher: JoinHandle<DispatchStats>,
    workers: Vec<JoinHandle<Result<WorkerStats>>>,
    collector: JoinHandle<CollectorSummary>,
    load: watch::Receiver<LoadSnapshot>,
    finished: watch::Receiver<bool>,
    shutdown: Shutdown,
}

impl Fabric {
    /// Spawn every component. The config is expected to be validated.
    pub fn start(config: &Config, metrics: Arc<Metrics>) -> Self {
        let shutdown = Shutdown::new();
        let seed = config.dispatch.seed;

        let (sample_tx, sample_rx) = mpsc::channel(config.sources.buffer);
        let (result_tx, result_rx) = mpsc::channel(config.processing.result_buffer);

        let mut queues = Vec::with_capacity(config.dispatch.worker_count);
        let mut workers = Vec::with_capacity(config.dispatch.worker_count);
        for id in 0..config.dispatch.worker_count {
            let (queue, inbound) = WorkerQueue::bounded(id, config.dispatch.queue_capacity);
            let worker = Worker::new(id, inbound, Pipeline::from_config(&config.pipeline), metrics.clone());
            workers.push(tokio::spawn(worker.run(result_tx.clone(), shutdown.clone())));
            queues.push(queue);
        }
        // The result sink closes when the last worker exits.
        drop(result_tx);

        let dispatcher = Dispatcher::new(queues, config.dispatch.overflow, seed, metrics.clone());
        let load = dispatcher.subscribe_load();
        let dispatcher = tokio::spawn(dispatcher.run(sample_rx, shutdown.clone()));

        let (finished_tx, finished) = watch::channel(false);
        let collector = Collector::new(metrics.clone()).run(result_rx, shutdown.clone());
        let collector = tokio::spawn(async move {
            let summary = collector.await;
            finished_tx.send_replace(true);
            summary
        });

        let sources = SourceSet::new(config.sources.clone(), seed, metrics).spawn(sample_tx, shutdown.clone());

        tracing::info!(
            "Fabric started: {} sources, {} workers (queue capacity {}), {} stages per pipeline",
            config.sources.count,
            config.dispatch.worker_count,
            config.dispatch.queue_capacity,
            config.stage_count()
        );

        Self {
            sources,
            dispatcher,
            workers,
            collector,
            load,
            finished,
            shutdown,
        }
    }

    /// Latest load distribution published by the dispatcher.
    pub fn load(&self) -> watch::Receiver<LoadSnapshot> {
        self.load.clone()
    }

    /// Stop every component at its next suspension point.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down fabric");
        self.shutdown.trigger();
    }

    /// Whether the collector has exited, which follows the last worker.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the collector has exited, without consuming the fabric.
    pub async fn finished(&self) {
        let mut finished = self.finished.clone();
        // A dropped sender means the collector task is gone as well.
        let _ = finished.wait_for(|&done| done).await;
    }

    /// Wait for every component and gather their stats.
    pub async fn join(self) -> Result<FabricStats> {
        let mut generated = 0;
        for source in self.sources {
            generated += source.await?;
        }
        let dispatch = self.dispatcher.await?;

        let mut workers = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            workers.push(worker.await??);
        }
        let collector = self.collector.await?;

        Ok(FabricStats {
            generated,
            dispatch,
            workers,
            collector,
        })
    }
}
