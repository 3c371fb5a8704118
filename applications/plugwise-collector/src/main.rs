use anyhow::Context;
use chrono::Local;
use clap::Parser;
use plugwise_collector::client::HttpTransport;
use plugwise_collector::{db, Collector, Config, RunMode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plugwise-collector")]
#[command(about = "Collect power and meter readings from Plugwise Stretch and Smile gateways")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $APP_CONFIG, then config/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for CSV files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds between collections in continuous mode
    #[arg(short, long)]
    interval: Option<u64>,

    /// Keep collecting until interrupted
    #[arg(short = 'C', long, conflicts_with = "single")]
    continuous: bool,

    /// Collect once and exit (default)
    #[arg(short, long)]
    single: bool,

    /// Skip the daily meter snapshot
    #[arg(long)]
    no_meters: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let cfg_path = cli
        .config
        .or_else(|| std::env::var("APP_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/config.yaml"));
    let mut cfg = Config::load(&cfg_path)
        .with_context(|| format!("loading config from {}", cfg_path.display()))?;

    if let Some(dir) = cli.output {
        cfg.output.directory = dir;
    }
    if let Some(secs) = cli.interval {
        cfg.collection.interval_secs = secs;
    }
    if cli.no_meters {
        cfg.collection.collect_meters = false;
    }
    cfg.validate()?;

    std::fs::create_dir_all(&cfg.output.directory).with_context(|| {
        format!("creating output directory {}", cfg.output.directory.display())
    })?;
    info!(
        config = %cfg_path.display(),
        output = %cfg.output.directory.display(),
        stretch = cfg.devices.stretch.enabled,
        smile = cfg.devices.smile.enabled,
        "loaded config"
    );

    let pool = match &cfg.database {
        Some(db_cfg) => {
            let pool = db::connect(&db_cfg.url, db_cfg.max_connections).await?;
            db::ensure_schema(&pool).await?;
            info!("connected to database");
            Some(pool)
        }
        None => None,
    };

    let transport = HttpTransport::new(Duration::from_secs(cfg.collection.timeout_secs))?;
    let mode = if cli.continuous && !cli.single {
        RunMode::Continuous
    } else {
        RunMode::Single
    };

    let mut collector = Collector::new(cfg, transport, Local::now().date_naive()).with_summary(true);
    if let Some(pool) = pool {
        collector = collector.with_db(pool);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; finishing current cycle");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
        }
    });

    let cycles = collector.run(mode, shutdown_rx).await;
    info!(cycles, "collector stopped");
    Ok(())
}
