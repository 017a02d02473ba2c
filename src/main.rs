//! Spinwire CLI
//!
//! Plays spins against the configured broker, runs the analytics consumer,
//! and reads the rollups back.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rand::Rng;
use serde_json::json;
use spinwire::{
    config::{generate_sample_config, ConfigLoader, LogLevel, SpinwireConfig},
    errors::{ConfigurationError, SpinwireResult},
    games::{PaymentRequest, SpinRequest},
    telemetry::init_logging,
    Aggregator, AmqpBroker, Broker, DailyPaymentStat, DailyStat, EventConsumer, EventPublisher,
    GameProcessor, InMemoryBroker, LogTraceSink, OptimizedStorage, PipelineMetrics, PlayerStat,
    RocksResultStore, SlotEngine, StatsReader, Topology, TraceContext,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

/// Spinwire slot results pipeline
#[derive(Parser)]
#[command(name = "spinwire")]
#[command(about = "Slot outcome pipeline with RabbitMQ-fed real-time analytics")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Spin the reels, persist and publish each result
    Play {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        bet: f64,

        /// Number of spins
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Publish the payment event for a settled spin
    Pay {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        bet: f64,

        #[arg(short, long)]
        payout: f64,
    },

    /// Run the analytics consumer until Ctrl-C
    Consume,

    /// Query the analytics rollups
    Stats {
        #[command(subcommand)]
        query: StatsQuery,
    },

    /// Run the whole pipeline in-process over an in-memory broker
    Demo {
        #[arg(short, long, default_value = "200")]
        spins: usize,
    },

    /// Write a sample configuration file
    Config {
        #[arg(short, long, default_value = "spinwire.toml")]
        output: String,
    },
}

#[derive(Subcommand)]
enum StatsQuery {
    /// Most recent days, newest first
    Daily {
        #[arg(short, long, default_value = "7")]
        days: usize,
    },

    /// Lifetime totals for one player
    Player { user_id: String },

    /// Payment counters for one day (YYYY-MM-DD)
    Payments { date: String },
}

#[tokio::main]
async fn main() -> SpinwireResult<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if cli.verbose {
        config.monitoring.log_level = LogLevel::Debug;
    }
    init_logging(&config.monitoring);

    match cli.command {
        Commands::Play { user, bet, count } => run_play(&config, user, bet, count).await,
        Commands::Pay { user, bet, payout } => run_pay(&config, user, bet, payout).await,
        Commands::Consume => run_consumer(&config).await,
        Commands::Stats { query } => run_stats(&config, query),
        Commands::Demo { spins } => run_demo(spins).await,
        Commands::Config { output } => {
            generate_sample_config(&output)?;
            println!("Sample configuration written to {}", output);
            Ok(())
        }
    }
}

fn amqp_broker(config: &SpinwireConfig) -> Arc<dyn Broker> {
    Arc::new(AmqpBroker::new(&config.broker.url, &config.broker.connection_name))
}

fn build_processor(
    config: &SpinwireConfig,
    broker: Arc<dyn Broker>,
    results: OptimizedStorage,
    metrics: Arc<PipelineMetrics>,
) -> SpinwireResult<(GameProcessor, Arc<EventPublisher>)> {
    let publisher = Arc::new(EventPublisher::new(broker, Topology::analytics(), metrics.clone()));
    let processor = GameProcessor::new(
        SlotEngine::from_config(&config.game)?,
        Arc::new(RocksResultStore::new(results)),
        publisher.clone(),
        Arc::new(LogTraceSink),
        metrics,
    );
    Ok((processor, publisher))
}

async fn run_play(config: &SpinwireConfig, user: String, bet: f64, count: usize) -> SpinwireResult<()> {
    let results = OptimizedStorage::open(&config.storage.results_directory, &config.storage)?;
    let metrics = Arc::new(PipelineMetrics::new());
    let (processor, publisher) = build_processor(config, amqp_broker(config), results, metrics.clone())?;

    for _ in 0..count {
        let response = processor
            .play(SpinRequest {
                user_id: user.clone(),
                bet,
                trace: TraceContext::new(),
            })
            .await?;
        println!("{}", serde_json::to_string(&response)?);
    }

    publisher.close().await;
    let snapshot = metrics.snapshot();
    info!(
        spins = snapshot.spins_played,
        published = snapshot.events_published,
        dropped = snapshot.publish_failures,
        "Done"
    );
    Ok(())
}

async fn run_pay(config: &SpinwireConfig, user: String, bet: f64, payout: f64) -> SpinwireResult<()> {
    let results = OptimizedStorage::open(&config.storage.results_directory, &config.storage)?;
    let (processor, publisher) =
        build_processor(config, amqp_broker(config), results, Arc::new(PipelineMetrics::new()))?;

    let outcome = processor
        .record_payment(PaymentRequest {
            user_id: user,
            bet,
            payout,
            balance_after: None,
            trace: TraceContext::new(),
        })
        .await?;
    publisher.close().await;

    println!("{:?}", outcome);
    Ok(())
}

async fn run_consumer(config: &SpinwireConfig) -> SpinwireResult<()> {
    let analytics = OptimizedStorage::open(&config.storage.analytics_directory, &config.storage)?;
    let metrics = Arc::new(PipelineMetrics::new());
    let consumer = EventConsumer::new(
        amqp_broker(config),
        Topology::analytics(),
        Arc::new(Aggregator::new(analytics, config.analytics.last_played)),
        Arc::new(LogTraceSink),
        metrics.clone(),
        config.consumer.clone(),
    );

    consumer.start();
    info!(url = %config.broker.url, "Consuming; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, stopping");
    }
    consumer.stop().await;

    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    Ok(())
}

fn run_stats(config: &SpinwireConfig, query: StatsQuery) -> SpinwireResult<()> {
    let reader = StatsReader::new(OptimizedStorage::open_read_only(
        &config.storage.analytics_directory,
    )?);

    let output = match query {
        StatsQuery::Daily { days } => {
            let stats = reader.recent_daily_stats(days)?;
            json!(stats.iter().map(daily_json).collect::<Vec<_>>())
        }
        StatsQuery::Player { user_id } => match reader.player_stat(&user_id)? {
            Some(stat) => player_json(&stat),
            None => json!({ "user_id": user_id, "found": false }),
        },
        StatsQuery::Payments { date } => {
            let day: NaiveDate = date.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "date".to_string(),
                value: date.clone(),
                reason: "expected YYYY-MM-DD".to_string(),
            })?;
            match reader.daily_payment_stat(day)? {
                Some(stat) => payments_json(&stat),
                None => json!({ "date": date, "found": false }),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn daily_json(stat: &DailyStat) -> serde_json::Value {
    json!({
        "date": stat.date,
        "total_games": stat.total_games,
        "total_bets": stat.total_bets,
        "total_payouts": stat.total_payouts,
        "total_wins": stat.total_wins,
        "unique_players": stat.unique_players.len(),
        "win_rate": stat.win_rate(),
        "rtp": stat.rtp(),
        "house_edge": stat.house_edge(),
        "net_profit": stat.net_profit(),
        "average_bet": stat.average_bet(),
    })
}

fn player_json(stat: &PlayerStat) -> serde_json::Value {
    json!({
        "user_id": stat.user_id,
        "total_games": stat.total_games,
        "total_bets": stat.total_bets,
        "total_payouts": stat.total_payouts,
        "total_wins": stat.total_wins,
        "win_rate": stat.win_rate(),
        "rtp": stat.rtp(),
        "net_profit": stat.net_profit(),
        "last_played": stat.last_played,
    })
}

fn payments_json(stat: &DailyPaymentStat) -> serde_json::Value {
    json!({
        "date": stat.date,
        "counts": stat.counts,
        "amounts": stat.amounts,
        "net_flow": stat.net_flow(),
    })
}

async fn run_demo(spins: usize) -> SpinwireResult<()> {
    let config = SpinwireConfig::testing();
    let root = std::env::temp_dir().join(format!("spinwire-demo-{}", uuid::Uuid::new_v4()));
    let results = OptimizedStorage::open(root.join("results"), &config.storage)?;
    let analytics = OptimizedStorage::open(root.join("analytics"), &config.storage)?;

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let metrics = Arc::new(PipelineMetrics::new());
    let aggregator = Arc::new(Aggregator::new(analytics, config.analytics.last_played));
    let consumer = EventConsumer::new(
        broker.clone(),
        Topology::analytics(),
        aggregator.clone(),
        Arc::new(LogTraceSink),
        metrics.clone(),
        config.consumer.clone(),
    );
    consumer.start();

    let (processor, _publisher) = build_processor(&config, broker, results, metrics.clone())?;
    info!(
        spins,
        theoretical_rtp = processor.engine().theoretical_rtp(),
        "Running demo pipeline"
    );

    let mut users = Vec::new();
    for _ in 0..spins {
        let (user, bet) = {
            let mut rng = rand::thread_rng();
            (format!("player-{}", rng.gen_range(1..=5)), rng.gen_range(1..=10) as f64)
        };
        let response = processor
            .play(SpinRequest {
                user_id: user.clone(),
                bet,
                trace: TraceContext::new(),
            })
            .await?;
        processor
            .record_payment(PaymentRequest {
                user_id: user.clone(),
                bet,
                payout: response.payout,
                balance_after: None,
                trace: TraceContext::new(),
            })
            .await?;
        users.push(user);
    }

    // Each spin produces a game result and a payment event
    let expected = (spins * 2) as u64;
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while metrics.snapshot().messages_acked < expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(acked = metrics.snapshot().messages_acked, expected, "Consumer did not drain in time");
    }
    consumer.stop().await;

    let reader = aggregator.reader();
    users.sort();
    users.dedup();
    let players = users
        .iter()
        .filter_map(|user| reader.player_stat(user).transpose())
        .collect::<SpinwireResult<Vec<_>>>()?;
    let output = json!({
        "daily": reader.recent_daily_stats(1)?.iter().map(daily_json).collect::<Vec<_>>(),
        "players": players.iter().map(player_json).collect::<Vec<_>>(),
        "metrics": metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    drop((reader, processor, consumer, aggregator));
    if let Err(e) = std::fs::remove_dir_all(&root) {
        warn!(error = %e, path = %root.display(), "Failed to remove demo directory");
    }
    Ok(())
}
