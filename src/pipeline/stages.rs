//! Staged validation pipeline run inside each worker.
//!
//! Each stage is its own task, connected to its neighbours by queues:
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Square root │────▶│   Square    │────▶│   Verify    │
//! │  (stage 0)  │     │  (stage 1)  │     │  (stage 2)  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!      entry                                   exit
//! ```
//!
//! A stage that records an error still forwards the task. Later stages see
//! an errored task and leave it alone, so every task walks the same fixed
//! topology and exits with its first error intact.

use crate::pipeline::queue::{stage_channel, StageReceiver, StageSender};
use crate::pipeline::Metrics;
use crate::shutdown::Shutdown;
use crate::task::{Task, TaskError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Default relative tolerance for the round-trip check.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// One transformation or validation step.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, task: Task) -> Task;
}

/// Stage 0: `intermediate = sqrt(source)`, rejecting negative input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquareRoot;

impl Stage for SquareRoot {
    fn name(&self) -> &'static str {
        "square_root"
    }

    fn process(&self, mut task: Task) -> Task {
        if task.is_errored() {
            return task;
        }
        let source = task.source();
        if source >= 0.0 {
            task.set_intermediate(source.sqrt());
        } else {
            task.fail(TaskError::NegativeArgument);
        }
        task
    }
}

/// Stage 1: `result = intermediate²`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Square;

impl Stage for Square {
    fn name(&self) -> &'static str {
        "square"
    }

    fn process(&self, mut task: Task) -> Task {
        if task.is_errored() {
            return task;
        }
        if let Some(intermediate) = task.intermediate() {
            task.set_result(intermediate * intermediate);
        }
        task
    }
}

/// Stage 2: check that `result` reproduces `source`.
///
/// The comparison is relative to `max(1, |source|)` so values near zero are
/// held to an absolute bound instead.
#[derive(Debug, Clone, Copy)]
pub struct Verify {
    tolerance: f64,
}

impl Verify {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    fn matches(&self, source: f64, result: f64) -> bool {
        (result - source).abs() <= self.tolerance * source.abs().max(1.0)
    }
}

impl Default for Verify {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl Stage for Verify {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn process(&self, mut task: Task) -> Task {
        if task.is_errored() {
            return task;
        }
        let consistent = task
            .result()
            .is_some_and(|result| self.matches(task.source(), result));
        if !consistent {
            task.fail(TaskError::RoundTripMismatch);
        }
        task
    }
}

/// Fault injection: shifts `result` by a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct Perturb {
    offset: f64,
}

impl Perturb {
    pub fn new(offset: f64) -> Self {
        Self { offset }
    }
}

impl Stage for Perturb {
    fn name(&self) -> &'static str {
        "perturb"
    }

    fn process(&self, mut task: Task) -> Task {
        if let Some(result) = task.result() {
            task.set_result(result + self.offset);
        }
        task
    }
}

/// Configurable stage selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    SquareRoot,
    Square,
    Verify,
    Perturb { offset: f64 },
}

impl StageKind {
    /// The three-stage validation chain.
    pub fn canonical() -> Vec<StageKind> {
        vec![StageKind::SquareRoot, StageKind::Square, StageKind::Verify]
    }

    /// Instantiate the stage. `tolerance` applies to `Verify`.
    pub fn build(self, tolerance: f64) -> Arc<dyn Stage> {
        match self {
            StageKind::SquareRoot => Arc::new(SquareRoot),
            StageKind::Square => Arc::new(Square),
            StageKind::Verify => Arc::new(Verify::new(tolerance)),
            StageKind::Perturb { offset } => Arc::new(Perturb::new(offset)),
        }
    }
}

/// Configuration for one worker's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in order; the pipeline depth is the length of this list
    #[serde(default = "StageKind::canonical")]
    pub stages: Vec<StageKind>,

    /// Inter-stage queue capacity, `None` for unbounded.
    /// Each stage handles one task at a time, so per-worker order is kept
    /// either way; a bound only adds backpressure inside the worker.
    #[serde(default)]
    pub stage_buffer: Option<usize>,

    /// Relative tolerance for `Verify`
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 { DEFAULT_TOLERANCE }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageKind::canonical(),
            stage_buffer: None,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Ordered chain of stages, not yet running.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    stage_buffer: Option<usize>,
}

impl Pipeline {
    /// Build a pipeline from explicit stages.
    pub fn new(stages: Vec<Arc<dyn Stage>>, stage_buffer: Option<usize>) -> Self {
        Self {
            stages,
            stage_buffer,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let stages = config
            .stages
            .iter()
            .map(|kind| kind.build(config.tolerance))
            .collect();
        Self::new(stages, config.stage_buffer)
    }

    /// Square root, square, verify.
    pub fn canonical() -> Self {
        Self::from_config(&PipelineConfig::default())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Spawn one task per stage.
    ///
    /// Closing the returned entry drains the chain: each stage exits once
    /// its input is closed and empty, which in turn closes the exit.
    pub fn spawn(self, worker: usize, metrics: Arc<Metrics>, shutdown: Shutdown) -> PipelineHandle {
        let (entry, mut upstream) = stage_channel(self.stage_buffer);
        let last = self.stages.len().saturating_sub(1);
        let mut handles = Vec::with_capacity(self.stages.len());

        for (index, stage) in self.stages.into_iter().enumerate() {
            let (tx, rx) = stage_channel(self.stage_buffer);
            let input = std::mem::replace(&mut upstream, rx);
            let runner = StageRunner {
                worker,
                index,
                is_last: index == last,
                stage,
                metrics: metrics.clone(),
            };
            handles.push(tokio::spawn(runner.run(input, tx, shutdown.clone())));
        }

        PipelineHandle {
            entry,
            exit: upstream,
            stages: handles,
        }
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    /// Queue into stage 0
    pub entry: StageSender,
    /// Queue out of the last stage
    pub exit: StageReceiver,
    /// Stage tasks; each returns the number of tasks it forwarded
    pub stages: Vec<JoinHandle<u64>>,
}

struct StageRunner {
    worker: usize,
    index: usize,
    is_last: bool,
    stage: Arc<dyn Stage>,
    metrics: Arc<Metrics>,
}

impl StageRunner {
    async fn run(self, mut input: StageReceiver, output: StageSender, shutdown: Shutdown) -> u64 {
        let mut forwarded = 0u64;

        loop {
            let task = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                task = input.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let task = self.apply(task);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sent = output.send(task) => {
                    if sent.is_err() {
                        tracing::debug!(
                            "Worker {} stage {} downstream closed, stopping",
                            self.worker, self.index
                        );
                        break;
                    }
                }
            }
            forwarded += 1;
        }

        tracing::debug!(
            "Worker {} stage {} ({}) finished after {} tasks",
            self.worker,
            self.index,
            self.stage.name(),
            forwarded
        );
        forwarded
    }

    fn apply(&self, task: Task) -> Task {
        // Errored tasks bypass `process` so no stage can touch them.
        let mut task = if task.is_errored() {
            task
        } else {
            let start = Instant::now();
            let task = self.stage.process(task);
            self.metrics.add_stage_time(start.elapsed());
            task
        };

        task.complete_stage(self.index);
        if self.is_last {
            task.finish();
        }

        tracing::trace!(
            worker = self.worker,
            stage = self.index,
            name = self.stage.name(),
            source = task.source(),
            error = ?task.error(),
            "stage complete"
        );
        task
    }
}
