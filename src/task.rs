//! Samples and the tasks that carry them through a worker pipeline.

use serde::Serialize;
use thiserror::Error;

/// A single value emitted by a source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Logical id of the producing source
    pub source_id: usize,

    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a new sample.
    pub fn new(source_id: usize, value: f64) -> Self {
        Self { source_id, value }
    }
}

/// Terminal error recorded on a task.
///
/// Task errors are data: a stage records one and forwards the task, it never
/// aborts the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskError {
    /// Validation error: square root of a negative value.
    #[error("negative argument")]
    NegativeArgument,

    /// Consistency error: squaring the square root did not give the source back.
    #[error("round-trip mismatch")]
    RoundTripMismatch,
}

/// Progress of a task through its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Not yet seen by any stage
    Created,
    /// Stage with this index has run
    Stage(usize),
    /// Left the final stage
    Done,
}

/// Final verdict on a completed task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskOutcome {
    Verified { result: f64 },
    Failed(TaskError),
    /// Task has not left the pipeline yet
    Pending,
}

/// The unit flowing through a pipeline.
///
/// `source` is fixed at creation. Once `error` is set the task is frozen:
/// `intermediate` and `result` can no longer change and the error itself can
/// be neither cleared nor replaced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    source_id: usize,
    worker: usize,
    source: f64,
    intermediate: Option<f64>,
    result: Option<f64>,
    error: Option<TaskError>,
    state: TaskState,
}

impl Task {
    /// Wrap a sample admitted into `worker`'s pipeline.
    pub fn new(sample: Sample, worker: usize) -> Self {
        Self {
            source_id: sample.source_id,
            worker,
            source: sample.value,
            intermediate: None,
            result: None,
            error: None,
            state: TaskState::Created,
        }
    }

    pub fn source(&self) -> f64 {
        self.source
    }

    pub fn source_id(&self) -> usize {
        self.source_id
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn intermediate(&self) -> Option<f64> {
        self.intermediate
    }

    pub fn result(&self) -> Option<f64> {
        self.result
    }

    pub fn error(&self) -> Option<TaskError> {
        self.error
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Set the stage 0 value. Returns false and leaves the task untouched if
    /// it already carries an error.
    pub fn set_intermediate(&mut self, value: f64) -> bool {
        if self.is_errored() {
            return false;
        }
        self.intermediate = Some(value);
        true
    }

    /// Set the stage 1 value. Same rule as [`Task::set_intermediate`].
    pub fn set_result(&mut self, value: f64) -> bool {
        if self.is_errored() {
            return false;
        }
        self.result = Some(value);
        true
    }

    /// Record an error. The first error wins; returns false if one was
    /// already present.
    pub fn fail(&mut self, error: TaskError) -> bool {
        if self.is_errored() {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// Mark stage `index` as run.
    pub(crate) fn complete_stage(&mut self, index: usize) {
        self.state = TaskState::Stage(index);
    }

    /// Mark the task as having left the pipeline.
    pub(crate) fn finish(&mut self) {
        self.state = TaskState::Done;
    }

    /// Verdict for a finished task.
    pub fn outcome(&self) -> TaskOutcome {
        if self.state != TaskState::Done {
            return TaskOutcome::Pending;
        }
        match (self.error, self.result) {
            (Some(error), _) => TaskOutcome::Failed(error),
            (None, Some(result)) => TaskOutcome::Verified { result },
            // A pipeline without a square stage never produces a result
            (None, None) => TaskOutcome::Pending,
        }
    }
}
