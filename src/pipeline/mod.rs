//! Dispatch and per-worker pipeline processing.

mod dispatcher;
mod metrics;
pub mod queue;
mod stages;
mod stats;
mod worker;

pub use dispatcher::{DispatchError, DispatchStats, Dispatched, Dispatcher, OverflowPolicy};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use queue::{StageReceiver, StageSender, WorkerQueue};
pub use stages::{
    Perturb, Pipeline, PipelineConfig, PipelineHandle, Square, SquareRoot, Stage, StageKind, Verify,
    DEFAULT_TOLERANCE,
};
pub use stats::{LoadSnapshot, LoadStats};
pub use worker::{Worker, WorkerStats};
