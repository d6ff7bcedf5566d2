//! Queue contracts between the dispatcher, workers and stages.

use crate::task::{Sample, Task};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Inbound queue of one worker, as seen by the dispatcher.
///
/// The dispatcher is the only writer. It can query occupancy without
/// blocking; the queue itself enforces `occupancy <= capacity`.
#[derive(Debug, Clone)]
pub struct WorkerQueue {
    index: usize,
    tx: mpsc::Sender<Sample>,
}

impl WorkerQueue {
    /// Create a queue of fixed `capacity` for worker `index`, returning the
    /// dispatcher side and the worker side.
    pub fn bounded(index: usize, capacity: usize) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { index, tx }, rx)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Samples currently queued and not yet taken by the worker.
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Occupancy strictly below capacity.
    pub fn has_room(&self) -> bool {
        self.tx.capacity() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue without waiting.
    pub fn try_send(&self, sample: Sample) -> Result<(), TrySendError<Sample>> {
        self.tx.try_send(sample)
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Sample> {
        &self.tx
    }
}

/// Create an inter-stage queue. `None` means unbounded.
pub fn stage_channel(capacity: Option<usize>) -> (StageSender, StageReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity);
            (StageSender::Bounded(tx), StageReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (StageSender::Unbounded(tx), StageReceiver::Unbounded(rx))
        }
    }
}

/// Writing end of an inter-stage queue.
#[derive(Debug, Clone)]
pub enum StageSender {
    Bounded(mpsc::Sender<Task>),
    Unbounded(mpsc::UnboundedSender<Task>),
}

impl StageSender {
    /// Send a task, waiting for room on a bounded queue. Returns the task
    /// back if the receiving stage is gone.
    pub async fn send(&self, task: Task) -> Result<(), Task> {
        match self {
            StageSender::Bounded(tx) => tx.send(task).await.map_err(|e| e.0),
            StageSender::Unbounded(tx) => tx.send(task).map_err(|e| e.0),
        }
    }
}

/// Reading end of an inter-stage queue.
#[derive(Debug)]
pub enum StageReceiver {
    Bounded(mpsc::Receiver<Task>),
    Unbounded(mpsc::UnboundedReceiver<Task>),
}

impl StageReceiver {
    /// Next task, or `None` once every sender is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Task> {
        match self {
            StageReceiver::Bounded(rx) => rx.recv().await,
            StageReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}
