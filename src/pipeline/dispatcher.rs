//! Capacity-aware admission of samples into worker queues.
//!
//! For every sample the dispatcher looks at the occupancy of each worker
//! queue, keeps the ones with room (the eligible set) and draws one of them
//! uniformly at random. Saturated workers are never picked. When nobody has
//! room the overflow policy decides: drop the sample, or wait for a slot.
//!
//! The occupancy check and the enqueue are not atomic. That is sound only
//! because the dispatcher is the sole writer to every worker queue; run
//! exactly one dispatcher per set of queues.

use crate::pipeline::{LoadSnapshot, LoadStats, Metrics, WorkerQueue};
use crate::shutdown::Shutdown;
use crate::task::Sample;
use futures::future::select_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// What to do with a sample when every worker queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the sample and report `CapacityExceeded`
    #[default]
    Drop,
    /// Wait until a worker frees a slot
    Block,
}

/// Why a sample was not admitted. The sample is gone either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("capacity exceeded: all {workers} worker queues are full")]
    CapacityExceeded { workers: usize },

    #[error("worker {worker} queue is closed")]
    WorkerClosed { worker: usize },

    #[error("shut down while waiting for capacity")]
    Shutdown,
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub worker: usize,
    pub load: LoadSnapshot,
}

/// Totals reported when the dispatcher stops.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub dropped: u64,
    pub load: LoadSnapshot,
}

impl std::fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dispatched: {}, Dropped: {} | {}",
            self.dispatched, self.dropped, self.load
        )
    }
}

/// Load balancer over a fixed set of worker queues.
pub struct Dispatcher<R = StdRng> {
    queues: Vec<WorkerQueue>,
    stats: LoadStats,
    rng: R,
    policy: OverflowPolicy,
    metrics: Arc<Metrics>,
    load_tx: watch::Sender<LoadSnapshot>,
    dropped: u64,
}

impl Dispatcher<StdRng> {
    /// Dispatcher with a `StdRng`, seeded when `seed` is given.
    pub fn new(queues: Vec<WorkerQueue>, policy: OverflowPolicy, seed: Option<u64>, metrics: Arc<Metrics>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(queues, policy, rng, metrics)
    }
}

impl<R: Rng> Dispatcher<R> {
    /// Dispatcher drawing from the given random source.
    pub fn with_rng(queues: Vec<WorkerQueue>, policy: OverflowPolicy, rng: R, metrics: Arc<Metrics>) -> Self {
        let stats = LoadStats::new(queues.len());
        let (load_tx, _) = watch::channel(stats.snapshot());
        Self {
            queues,
            stats,
            rng,
            policy,
            metrics,
            load_tx,
            dropped: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Receiver that always holds the latest load distribution.
    pub fn subscribe_load(&self) -> watch::Receiver<LoadSnapshot> {
        self.load_tx.subscribe()
    }

    /// Indices of live workers whose queue is below capacity.
    pub fn eligible(&self) -> Vec<usize> {
        self.queues
            .iter()
            .enumerate()
            .filter(|(_, queue)| !queue.is_closed() && queue.has_room())
            .map(|(index, _)| index)
            .collect()
    }

    /// Admit `sample` into a random eligible worker.
    ///
    /// Never waits under [`OverflowPolicy::Drop`].
    pub async fn dispatch(&mut self, sample: Sample) -> Result<Dispatched, DispatchError> {
        let result = match self.try_dispatch(sample) {
            Err(DispatchError::CapacityExceeded { .. }) if self.policy == OverflowPolicy::Block => {
                self.wait_for_capacity(sample).await
            }
            other => other,
        };

        match &result {
            Ok(dispatched) => {
                tracing::debug!(
                    "Source {} sample {:.4} -> worker {} | {}",
                    sample.source_id,
                    sample.value,
                    dispatched.worker,
                    dispatched.load
                );
            }
            Err(e) => {
                self.dropped += 1;
                self.metrics.add_sample_dropped();
                tracing::warn!(
                    "Dropped sample {:.4} from source {}: {}",
                    sample.value,
                    sample.source_id,
                    e
                );
            }
        }
        result
    }

    fn try_dispatch(&mut self, sample: Sample) -> Result<Dispatched, DispatchError> {
        let eligible = self.eligible();
        if eligible.is_empty() {
            return Err(self.no_room());
        }

        let worker = eligible[self.rng.gen_range(0..eligible.len())];
        match self.queues[worker].try_send(sample) {
            Ok(()) => Ok(self.admitted(worker)),
            // Only reachable if another writer broke the single-dispatcher rule.
            Err(TrySendError::Full(_)) => Err(DispatchError::CapacityExceeded {
                workers: self.queues.len(),
            }),
            Err(TrySendError::Closed(_)) => Err(DispatchError::WorkerClosed { worker }),
        }
    }

    /// `WorkerClosed` once every queue is closed, `CapacityExceeded` otherwise.
    fn no_room(&self) -> DispatchError {
        match self.queues.first() {
            Some(first) if self.queues.iter().all(WorkerQueue::is_closed) => {
                DispatchError::WorkerClosed { worker: first.index() }
            }
            _ => DispatchError::CapacityExceeded {
                workers: self.queues.len(),
            },
        }
    }

    async fn wait_for_capacity(&mut self, sample: Sample) -> Result<Dispatched, DispatchError> {
        let worker = loop {
            let reservations: Vec<_> = self
                .queues
                .iter()
                .filter(|queue| !queue.is_closed())
                .map(|queue| {
                    Box::pin(async move { (queue.index(), queue.sender().reserve().await) })
                })
                .collect();
            if reservations.is_empty() {
                return Err(self.no_room());
            }

            let ((worker, permit), _, _pending) = select_all(reservations).await;
            match permit {
                Ok(permit) => {
                    permit.send(sample);
                    break worker;
                }
                // Closed while waiting; retry over the remaining queues.
                Err(_) => tracing::debug!("Worker {} closed while waiting for capacity", worker),
            }
        };

        Ok(self.admitted(worker))
    }

    fn admitted(&mut self, worker: usize) -> Dispatched {
        self.stats.record(worker);
        self.metrics.add_sample_dispatched();
        let load = self.stats.snapshot();
        self.load_tx.send_replace(load.clone());
        Dispatched { worker, load }
    }

    /// Dispatch samples until the input closes or shutdown fires.
    ///
    /// Dropping the dispatcher on return closes every worker queue.
    pub async fn run(mut self, mut samples: mpsc::Receiver<Sample>, shutdown: Shutdown) -> DispatchStats {
        tracing::info!(
            "Dispatcher started with {} workers ({:?} on overflow)",
            self.queues.len(),
            self.policy
        );

        loop {
            let sample = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sample = samples.recv() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };

            let cancelled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => true,
                _ = self.dispatch(sample) => false,
            };
            if cancelled {
                self.dropped += 1;
                self.metrics.add_sample_dropped();
                tracing::debug!("Dropped sample {:.4}: {}", sample.value, DispatchError::Shutdown);
                break;
            }
        }

        let stats = DispatchStats {
            dispatched: self.stats.total(),
            dropped: self.dropped,
            load: self.stats.snapshot(),
        };
        tracing::info!("Dispatcher stopped. {}", stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queues(workers: usize, capacity: usize) -> (Vec<WorkerQueue>, Vec<mpsc::Receiver<Sample>>) {
        (0..workers).map(|i| WorkerQueue::bounded(i, capacity)).unzip()
    }

    fn seeded(queues: Vec<WorkerQueue>, policy: OverflowPolicy) -> Dispatcher {
        Dispatcher::new(queues, policy, Some(42), Metrics::new())
    }

    #[tokio::test]
    async fn test_saturation_drops_excess() {
        // 5 workers, capacity 2, 11 samples, nobody draining
        let (queues, _receivers) = queues(5, 2);
        let metrics = Metrics::new();
        let mut dispatcher = Dispatcher::new(queues, OverflowPolicy::Drop, Some(7), metrics.clone());

        let mut accepted = 0;
        let mut capacity_exceeded = 0;
        for i in 0..11 {
            match dispatcher.dispatch(Sample::new(0, i as f64)).await {
                Ok(_) => accepted += 1,
                Err(DispatchError::CapacityExceeded { workers }) => {
                    assert_eq!(workers, 5);
                    capacity_exceeded += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted, 10);
        assert!(capacity_exceeded >= 1);
        assert_eq!(dispatcher.stats().counts(), &[2, 2, 2, 2, 2]);
        assert_eq!(metrics.snapshot().samples_dropped, 1);
        assert_eq!(metrics.snapshot().samples_dispatched, 10);
    }

    #[tokio::test]
    async fn test_drop_leaves_stats_unchanged() {
        let (queues, _receivers) = queues(2, 1);
        let mut dispatcher = seeded(queues, OverflowPolicy::Drop);

        dispatcher.dispatch(Sample::new(0, 1.0)).await.unwrap();
        dispatcher.dispatch(Sample::new(0, 2.0)).await.unwrap();
        let before = dispatcher.stats().counts().to_vec();

        let err = dispatcher.dispatch(Sample::new(0, 3.0)).await.unwrap_err();
        assert_eq!(err, DispatchError::CapacityExceeded { workers: 2 });
        assert_eq!(dispatcher.stats().counts(), before.as_slice());
        assert_eq!(dispatcher.stats().total(), 2);
    }

    #[tokio::test]
    async fn test_never_picks_a_full_worker() {
        let (queues, mut receivers) = queues(4, 3);
        // Fill workers 0 and 2 from outside before the dispatcher runs.
        for worker in [0, 2] {
            for _ in 0..3 {
                queues[worker].try_send(Sample::new(9, 0.0)).unwrap();
            }
        }
        let mut dispatcher = seeded(queues, OverflowPolicy::Drop);
        assert_eq!(dispatcher.eligible(), vec![1, 3]);

        for i in 0..6 {
            let dispatched = dispatcher.dispatch(Sample::new(0, i as f64)).await.unwrap();
            assert!(dispatched.worker == 1 || dispatched.worker == 3);
        }
        assert_eq!(dispatcher.stats().counts()[0], 0);
        assert_eq!(dispatcher.stats().counts()[2], 0);
        assert!(dispatcher.eligible().is_empty());

        // Draining one slot makes exactly that worker eligible again.
        receivers[2].try_recv().unwrap();
        assert_eq!(dispatcher.eligible(), vec![2]);
        assert_eq!(dispatcher.dispatch(Sample::new(0, 7.0)).await.unwrap().worker, 2);
    }

    #[tokio::test]
    async fn test_counters_sum_to_dispatches_and_shares_to_hundred() {
        let (queues, mut receivers) = queues(3, 2);
        let mut dispatcher = seeded(queues, OverflowPolicy::Drop);

        let mut ok = 0u64;
        for i in 0..50 {
            if dispatcher.dispatch(Sample::new(0, i as f64)).await.is_ok() {
                ok += 1;
            }
            // Drain one worker every other round.
            if i % 2 == 0 {
                let _ = receivers[i % 3].try_recv();
            }
            let counts_sum: u64 = dispatcher.stats().counts().iter().sum();
            assert_eq!(counts_sum, ok);

            let shares: f64 = dispatcher.stats().snapshot().shares.iter().sum();
            assert!(shares == 0.0 || (shares - 100.0).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_seeded_dispatch_is_reproducible() {
        async fn choices(seed: u64) -> Vec<usize> {
            let (queues, mut receivers) = queues(6, 1);
            let mut dispatcher = Dispatcher::new(queues, OverflowPolicy::Drop, Some(seed), Metrics::new());
            let mut picks = Vec::new();
            for i in 0..30 {
                let worker = dispatcher.dispatch(Sample::new(0, i as f64)).await.unwrap().worker;
                receivers[worker].try_recv().unwrap();
                picks.push(worker);
            }
            picks
        }

        assert_eq!(choices(1234).await, choices(1234).await);
    }

    #[tokio::test]
    async fn test_snapshot_published_after_dispatch() {
        let (queues, _receivers) = queues(2, 4);
        let mut dispatcher = seeded(queues, OverflowPolicy::Drop);
        let load = dispatcher.subscribe_load();
        assert_eq!(load.borrow().total, 0);

        let dispatched = dispatcher.dispatch(Sample::new(0, 1.0)).await.unwrap();
        assert_eq!(load.borrow().total, 1);
        assert_eq!(load.borrow().shares[dispatched.worker], 100.0);
        assert_eq!(*load.borrow(), dispatched.load);
    }

    #[tokio::test]
    async fn test_closed_worker_reports_error() {
        let (queues, receivers) = queues(1, 2);
        drop(receivers);
        let mut dispatcher = seeded(queues, OverflowPolicy::Drop);
        assert_eq!(
            dispatcher.dispatch(Sample::new(0, 1.0)).await.unwrap_err(),
            DispatchError::WorkerClosed { worker: 0 }
        );
        assert_eq!(dispatcher.stats().total(), 0);
    }

    #[tokio::test]
    async fn test_closed_worker_is_not_eligible() {
        let (queues, mut receivers) = queues(2, 100);
        drop(receivers.remove(0));
        let mut dispatcher = seeded(queues, OverflowPolicy::Drop);
        assert_eq!(dispatcher.eligible(), vec![1]);

        for i in 0..50 {
            let dispatched = dispatcher.dispatch(Sample::new(0, i as f64)).await.unwrap();
            assert_eq!(dispatched.worker, 1);
        }
        assert_eq!(dispatcher.stats().counts(), &[0, 50]);
    }

    #[tokio::test]
    async fn test_block_policy_skips_closed_worker() {
        let (queues, mut receivers) = queues(2, 1);
        drop(receivers.remove(0));
        let mut dispatcher = seeded(queues, OverflowPolicy::Block);
        assert_eq!(dispatcher.dispatch(Sample::new(0, 1.0)).await.unwrap().worker, 1);

        let mut rx1 = receivers.pop().unwrap();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            rx1.recv().await.unwrap();
            rx1
        });

        let dispatched = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch(Sample::new(0, 2.0)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(dispatched.worker, 1);

        let mut rx1 = drain.await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().value, 2.0);
    }

    #[tokio::test]
    async fn test_block_policy_without_workers() {
        let mut dispatcher = Dispatcher::with_rng(
            Vec::new(),
            OverflowPolicy::Block,
            StdRng::seed_from_u64(1),
            Metrics::new(),
        );
        assert_eq!(
            dispatcher.dispatch(Sample::new(0, 1.0)).await.unwrap_err(),
            DispatchError::CapacityExceeded { workers: 0 }
        );
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_a_slot() {
        let (queues, mut receivers) = queues(2, 1);
        let mut dispatcher = seeded(queues, OverflowPolicy::Block);
        dispatcher.dispatch(Sample::new(0, 1.0)).await.unwrap();
        dispatcher.dispatch(Sample::new(0, 2.0)).await.unwrap();

        let mut rx1 = receivers.pop().unwrap();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx1.recv().await.unwrap();
            (first, rx1)
        });

        let dispatched = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch(Sample::new(0, 3.0)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(dispatched.worker, 1);
        assert_eq!(dispatcher.stats().total(), 3);

        let (_first, mut rx1) = drain.await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().value, 3.0);
    }

    #[tokio::test]
    async fn test_run_until_input_closes() {
        let (queues, mut receivers) = queues(2, 8);
        let dispatcher = seeded(queues, OverflowPolicy::Drop);
        let (tx, rx) = mpsc::channel(4);

        let handle = tokio::spawn(dispatcher.run(rx, Shutdown::new()));
        for i in 0..5 {
            tx.send(Sample::new(1, i as f64)).await.unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.dropped, 0);

        // Worker queues close once the dispatcher is gone.
        let mut received = 0;
        for rx in receivers.iter_mut() {
            while rx.recv().await.is_some() {
                received += 1;
            }
        }
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (queues, _receivers) = queues(1, 1);
        let dispatcher = seeded(queues, OverflowPolicy::Block);
        let (tx, rx) = mpsc::channel(4);
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        // Second sample blocks: the only queue is full and nobody drains it.
        tx.send(Sample::new(0, 1.0)).await.unwrap();
        tx.send(Sample::new(0, 2.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.dropped, 1);
    }
}
