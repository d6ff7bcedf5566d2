//! Sample Fabric
//!
//! A concurrent sample-processing fabric: independent sources emit numeric
//! samples, a load balancer admits each one into a randomly chosen worker
//! with spare queue capacity, and every worker runs its samples through a
//! staged pipeline (square root, square, round-trip verification) before a
//! collector reports the outcome.
//!
//! # Architecture
//!
//! - **Source**: Random-delay sample producers
//! - **Dispatcher**: Random choice among workers with room, drop or block on overflow
//! - **Worker**: Bounded inbound queue feeding one pipeline task per stage
//! - **Collector**: Drains the shared result sink
//! - **LoadStats**: Per-worker dispatch shares, published after every admission
//!
//! # Usage
//!
//! ```no_run
//! use sample_fabric::{run_fabric, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"fabric.yaml".into())?;
//!     run_fabric(config).await?;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod fabric;
pub mod pipeline;
pub mod shutdown;
pub mod source;
pub mod task;


pub use collector::{Collector, CollectorSummary};
pub use config::Config;
pub use fabric::{Fabric, FabricStats};
pub use pipeline::{Dispatcher, LoadSnapshot, LoadStats, Metrics, OverflowPolicy, Pipeline, Worker};
pub use shutdown::Shutdown;
pub use task::{Sample, Task, TaskError};

use anyhow::Result;
use pipeline::MetricsReporter;
use std::time::Duration;
use tokio::sync::mpsc;

/// Run the fabric until the sources finish, the configured duration
/// elapses or Ctrl-C arrives.
pub async fn run_fabric(config: Config) -> Result<FabricStats> {
    config.validate()?;

    tracing::info!("Starting Sample Fabric");

    let metrics = Metrics::new();
    let fabric = Fabric::start(&config, metrics.clone());

    let reporter = MetricsReporter::new(metrics.clone(), config.processing.metrics_interval_secs)
        .with_load(fabric.load());
    let (reporter_tx, reporter_rx) = mpsc::channel(1);
    let (reporter_task, idle_reporter) = if config.processing.enable_metrics {
        (Some(tokio::spawn(reporter.run(reporter_rx))), None)
    } else {
        (None, Some(reporter))
    };

    let deadline = async {
        match config.processing.run_duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let signal = tokio::select! {
        _ = fabric.finished() => {
            tracing::info!("All sources finished and the fabric drained");
            Ok(())
        }
        _ = deadline => {
            tracing::info!("Run duration elapsed");
            Ok(())
        }
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                tracing::info!("Interrupted");
            }
            result
        }
    };

    // Stop every task before surfacing a signal-handler failure.
    fabric.shutdown();
    let stats = fabric.join().await?;

    let reporter = match reporter_task {
        Some(task) => {
            let _ = reporter_tx.send(()).await;
            Some(task.await?)
        }
        None => idle_reporter,
    };
    signal?;

    if let Some(reporter) = reporter {
        reporter.print_summary();
    }

    if let Some(path) = &config.processing.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }

    tracing::info!("Fabric complete: {}", stats);

    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
