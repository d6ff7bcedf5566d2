//! Configuration for the sample fabric.

use crate::pipeline::{OverflowPolicy, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the fabric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sample producers
    #[serde(default)]
    pub sources: SourceConfig,

    /// Load balancer and worker queues
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-worker pipeline
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Runtime and reporting
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Sample source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Number of independent sources
    #[serde(default = "default_source_count")]
    pub count: usize,

    /// Range generated values are drawn from
    #[serde(default)]
    pub sample_range: SampleRange,

    /// Upper bound (exclusive) of the random delay before each sample
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Capacity of the channel from sources to the dispatcher
    #[serde(default = "default_source_buffer")]
    pub buffer: usize,

    /// Stop each source after this many samples. Runs until shutdown if unset.
    #[serde(default)]
    pub samples_per_source: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            count: default_source_count(),
            sample_range: SampleRange::default(),
            max_delay_ms: default_max_delay_ms(),
            buffer: default_source_buffer(),
            samples_per_source: None,
        }
    }
}

/// Half-open range `[min, max)` for generated samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRange {
    pub min: f64,
    pub max: f64,
}

impl Default for SampleRange {
    fn default() -> Self {
        Self {
            min: -100.0,
            max: 100.0,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bound of each worker's inbound queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Behaviour when every worker queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Seed for dispatch and source randomness. Entropy if unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            seed: None,
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Capacity of the shared result sink
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,

    /// Stop after this many seconds. Runs until the sources finish or
    /// Ctrl-C if unset.
    #[serde(default)]
    pub run_duration_secs: Option<u64>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            result_buffer: default_result_buffer(),
            run_duration_secs: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Pipeline depth.
    pub fn stage_count(&self) -> usize {
        self.pipeline.stages.len()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.count == 0 {
            anyhow::bail!("Source count must be > 0");
        }
        if self.sources.buffer == 0 {
            anyhow::bail!("Source buffer must be > 0");
        }
        let range = self.sources.sample_range;
        if !range.min.is_finite() || !range.max.is_finite() || range.min >= range.max {
            anyhow::bail!(
                "Sample range must be finite with min < max (got [{}, {}))",
                range.min,
                range.max
            );
        }
        if self.dispatch.worker_count == 0 {
            anyhow::bail!("Worker count must be > 0");
        }
        if self.dispatch.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be > 0");
        }
        if self.pipeline.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }
        if self.pipeline.stage_buffer == Some(0) {
            anyhow::bail!("Stage buffer must be > 0 (omit it for unbounded)");
        }
        if !self.pipeline.tolerance.is_finite() || self.pipeline.tolerance <= 0.0 {
            anyhow::bail!("Tolerance must be a positive finite number");
        }
        if self.processing.result_buffer == 0 {
            anyhow::bail!("Result buffer must be > 0");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0 when metrics are enabled");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_source_count() -> usize { 6 }
fn default_max_delay_ms() -> u64 { 1000 }
fn default_source_buffer() -> usize { 1 }
fn default_worker_count() -> usize { 5 }
fn default_queue_capacity() -> usize { 2 }
fn default_result_buffer() -> usize { 1024 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
