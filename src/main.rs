//! Sample Fabric CLI
//!
//! Runs random samples through a load-balanced pool of staged workers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sample_fabric::{build_runtime, run_fabric, Config};

#[derive(Parser)]
#[command(name = "sample-fabric")]
#[command(about = "Load-balance random samples across staged workers", long_about = None)]
struct Cli {
    /// Path to configuration file (built-in defaults if omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override worker count
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Override per-worker queue capacity
    #[arg(long, global = true)]
    capacity: Option<usize>,

    /// Override random seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Stop after this many seconds
    #[arg(long, global = true)]
    duration: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fabric (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "fabric.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli)?;
            run_command(config)?;
        }

        Some(Commands::Validate) => {
            let config = load_config(&cli)?;
            config.validate()?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Apply overrides
    if let Some(workers) = cli.workers {
        config.dispatch.worker_count = workers;
    }
    if let Some(capacity) = cli.capacity {
        config.dispatch.queue_capacity = capacity;
    }
    if let Some(seed) = cli.seed {
        config.dispatch.seed = Some(seed);
    }
    if let Some(duration) = cli.duration {
        config.processing.run_duration_secs = Some(duration);
    }

    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async { run_fabric(config).await })?;

    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# Sample Fabric Configuration

# === SOURCES: Random sample producers ===
sources:
  # Number of independent sources
  count: 6

  # Values are drawn uniformly from [min, max)
  sample_range:
    min: -100.0
    max: 100.0

  # Each source sleeps a random 0..max_delay_ms before every sample
  max_delay_ms: 1000

  # Capacity of the channel into the dispatcher
  buffer: 1

  # Stop each source after this many samples (omit to run until shutdown)
  # samples_per_source: 100

# === DISPATCH: Load balancing across workers ===
dispatch:
  worker_count: 5

  # Bounded inbound queue per worker
  queue_capacity: 2

  # What to do when every worker queue is full: drop | block
  overflow: drop

  # Fix the seed for reproducible runs
  # seed: 42

# === PIPELINE: Stages every worker runs in order ===
pipeline:
  stages:
    - kind: square_root
    - kind: square
    - kind: verify

  # Bound of the queues between stages (omit for unbounded)
  # stage_buffer: 16

  # Relative tolerance of the round-trip check
  tolerance: 1.0e-9

# === PROCESSING: Runtime and reporting ===
processing:
  # Tokio worker threads (null = num CPUs)
  # worker_threads: 4

  # Capacity of the shared result sink
  result_buffer: 1024

  # Stop after this many seconds (omit to run until sources finish or Ctrl-C)
  # run_duration_secs: 30

  # Print throughput and load metrics during the run
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Write final metrics as JSON
  # metrics_output_path: "fabric-metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["sample-fabric"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["sample-fabric", "-c", "other.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("other.yaml")));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["sample-fabric", "validate", "-c", "test.json"]);
        assert!(matches!(cli.unwrap().command, Some(Commands::Validate)));
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let cli = Cli::try_parse_from([
            "sample-fabric",
            "run",
            "--workers",
            "3",
            "--capacity",
            "7",
            "--seed",
            "11",
            "--duration",
            "2",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.dispatch.worker_count, 3);
        assert_eq!(config.dispatch.queue_capacity, 7);
        assert_eq!(config.dispatch.seed, Some(11));
        assert_eq!(config.processing.run_duration_secs, Some(2));
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.yaml");
        generate_config_command(path.clone()).unwrap();
        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.stage_count(), 3);
    }
}
