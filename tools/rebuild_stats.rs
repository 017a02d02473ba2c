//! Rebuild analytics rollups from the result store
//!
//! Replays every persisted game result into a fresh analytics database.
//! Use it after a double-count episode or when the analytics DB is lost.
//! Payment counters are not rebuilt; payment events are never persisted.
//!
//! # Usage
//! ```bash
//! rebuild_stats --config spinwire.toml --output ./DB/analytics.rebuilt
//! ```

use clap::Parser;
use spinwire::{
    config::ConfigLoader, errors::SpinwireResult, telemetry::init_logging, Aggregator,
    OptimizedStorage, RocksResultStore,
};
use std::{path::PathBuf, time::Instant};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rebuild_stats")]
#[command(about = "Recompute analytics rollups from stored game results")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Results database (defaults to storage.results_directory)
    #[arg(short, long)]
    results: Option<PathBuf>,

    /// Directory for the rebuilt analytics database; must not exist yet
    #[arg(short, long)]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %e, "Rebuild failed");
        eprintln!("rebuild_stats: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> SpinwireResult<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let config = loader.load()?;
    init_logging(&config.monitoring);

    if args.output.exists() {
        return Err(spinwire::errors::StorageError::AlreadyExists(format!(
            "{} already exists; refusing to merge into existing rollups",
            args.output.display()
        ))
        .into());
    }

    let results_path = args
        .results
        .unwrap_or_else(|| PathBuf::from(&config.storage.results_directory));
    let results = RocksResultStore::new(OptimizedStorage::open_read_only(&results_path)?);
    let aggregator = Aggregator::new(
        OptimizedStorage::open(&args.output, &config.storage)?,
        config.analytics.last_played,
    );

    info!(results = %results_path.display(), output = %args.output.display(), "Rebuilding rollups");
    let started = Instant::now();
    let mut replayed = 0u64;
    results.for_each_result(|result| {
        aggregator.apply_game_result(&result)?;
        replayed += 1;
        if replayed % 10_000 == 0 {
            info!(replayed, "Progress");
        }
        Ok(())
    })?;

    let days = aggregator.reader().recent_daily_stats(usize::MAX)?.len();
    info!(
        replayed,
        days,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Rebuild complete"
    );
    println!("Replayed {} results across {} days into {}", replayed, days, args.output.display());
    Ok(())
}
