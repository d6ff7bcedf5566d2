//! Sample sources feeding the dispatcher.

use crate::config::SourceConfig;
use crate::pipeline::Metrics;
use crate::shutdown::Shutdown;
use crate::task::Sample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A set of independent sample producers sharing one output channel.
pub struct SourceSet {
    config: SourceConfig,
    seed: Option<u64>,
    metrics: Arc<Metrics>,
}

impl SourceSet {
    /// With `seed` set, source `i` draws from `StdRng::seed_from_u64(seed + 1 + i)`.
    pub fn new(config: SourceConfig, seed: Option<u64>, metrics: Arc<Metrics>) -> Self {
        Self { config, seed, metrics }
    }

    /// Spawn one task per source. Each returns the number of samples it sent.
    ///
    /// The output channel closes once every source has stopped.
    pub fn spawn(self, output: mpsc::Sender<Sample>, shutdown: Shutdown) -> Vec<JoinHandle<u64>> {
        (0..self.config.count)
            .map(|id| {
                let rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1 + id as u64)),
                    None => StdRng::from_entropy(),
                };
                let source = Source {
                    id,
                    config: self.config.clone(),
                    rng,
                    metrics: self.metrics.clone(),
                };
                tokio::spawn(source.run(output.clone(), shutdown.clone()))
            })
            .collect()
    }
}

struct Source {
    id: usize,
    config: SourceConfig,
    rng: StdRng,
    metrics: Arc<Metrics>,
}

impl Source {
    async fn run(mut self, output: mpsc::Sender<Sample>, shutdown: Shutdown) -> u64 {
        let mut sent = 0u64;

        while self.config.samples_per_source.map_or(true, |limit| sent < limit) {
            let delay = self.next_delay();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let sample = Sample::new(self.id, self.next_value());
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sent_ok = output.send(sample) => {
                    if sent_ok.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(
                "Source {} puts {:.4} into the data channel after {:?}",
                self.id,
                sample.value,
                delay
            );
            self.metrics.add_sample_generated();
            sent += 1;
        }

        tracing::debug!("Source {} stopped after {} samples", self.id, sent);
        sent
    }

    fn next_delay(&mut self) -> Duration {
        if self.config.max_delay_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..self.config.max_delay_ms))
        }
    }

    fn next_value(&mut self) -> f64 {
        let range = self.config.sample_range;
        self.rng.gen_range(range.min..range.max)
    }
}
