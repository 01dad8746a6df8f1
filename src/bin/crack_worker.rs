use clap::Parser;
use crackhash::amqp::AmqpReceiverConnector;
use crackhash::config::WorkerConfig;
use crackhash::error::CrackError;
use crackhash::worker::{WorkerCoordinator, WorkerSettings};
use crossbeam_channel::unbounded;
use dotenv::dotenv;
use tracing::info;

#[derive(Parser)]
#[command(name = "crack_worker")]
#[command(about = "Searches partitions handed out by the manager", long_about = None)]
struct Cli {
    /// Overrides CRACK_WORKER_PREFETCH
    #[arg(long)]
    prefetch: Option<u16>,
    /// Overrides CRACK_PROGRESS_LOG_INTERVAL
    #[arg(long)]
    progress_log_interval: Option<u64>,
}

fn main() -> Result<(), CrackError> {
    dotenv().ok();
    crackhash::init_tracing("crack-worker");
    let cli = Cli::parse();
    let mut config = WorkerConfig::from_env()?;
    if let Some(prefetch) = cli.prefetch {
        config.prefetch = prefetch.max(1);
    }
    if let Some(interval) = cli.progress_log_interval {
        config.progress_log_interval = interval;
    }

    let (events, inbox) = unbounded();
    let connector = AmqpReceiverConnector::new(config.broker.clone(), config.prefetch, events.clone());
    let worker = WorkerCoordinator::new(connector, events, WorkerSettings::from(&config));
    info!(prefetch = config.prefetch, "worker started");
    worker.run(inbox);
    Ok(())
}
