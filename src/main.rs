use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use transfer_reconciler::config::{parse_state, Cli, Commands, RunArgs};
use transfer_reconciler::db::{QueueStore, SqliteQueueStore, StoreConfig};
use transfer_reconciler::enqueuer::Enqueuer;
use transfer_reconciler::reconciler::Reconciler;
use transfer_reconciler::source::{ChainEventSource, EventSource};
use transfer_reconciler::worker::{spawn_workers, LogHandler};

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => run(&cli.db_path, args).await,
        Commands::Status { id, state } => status(&cli.db_path, id.as_deref(), state.as_deref()),
    }
}

async fn run(db_path: &str, args: &RunArgs) -> Result<()> {
    let settings = args.settings()?;

    let store = Arc::new(
        SqliteQueueStore::open(db_path, settings.store)
            .with_context(|| format!("opening queue at {}", db_path))?,
    );
    let source: Arc<dyn EventSource> = Arc::new(
        ChainEventSource::connect(&settings.ws_url, settings.contract, settings.source)
            .await
            .context("connecting to chain endpoint")?,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down.");
            }
            shutdown.cancel();
        });
    }

    let queue: Arc<dyn QueueStore> = store.clone();
    let workers = spawn_workers(
        settings.workers,
        queue.clone(),
        Arc::new(LogHandler),
        settings.worker,
        shutdown.clone(),
    );
    let pruner = settings
        .retention
        .map(|retention| tokio::spawn(prune_periodically(store.clone(), retention, shutdown.clone())));

    let enqueuer = Enqueuer::with_max_attempts(queue, settings.max_attempts);
    let reconciler = Reconciler::new(source, enqueuer, settings.reconciler);
    let outcome = reconciler.run(shutdown.clone()).await;

    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            error!("worker task failed: {}", e);
        }
    }
    if let Some(pruner) = pruner {
        if let Err(e) = pruner.await {
            error!("prune task failed: {}", e);
        }
    }

    let stats = outcome.context("reconciliation stopped")?;
    info!("done: {:?}", stats);
    Ok(())
}

async fn prune_periodically(store: Arc<SqliteQueueStore>, retention: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match store.prune_finished(retention) {
                Ok(0) => {}
                Ok(n) => info!("pruned {} finished job(s).", n),
                Err(e) => warn!("pruning finished jobs failed: {}", e),
            },
        }
    }
}

fn status(db_path: &str, id: Option<&str>, state: Option<&str>) -> Result<()> {
    let store = SqliteQueueStore::open(db_path, StoreConfig::default())
        .with_context(|| format!("opening queue at {}", db_path))?;

    if let Some(id) = id {
        match store.get(&id.to_lowercase())? {
            Some(job) => println!(
                "Job: {}\nState: {}\nAttempts: {}/{}\nLast error: {}\nPayload: {}",
                job.id,
                job.state,
                job.attempts,
                job.max_attempts,
                job.last_error.as_deref().unwrap_or("-"),
                serde_json::to_string(&job.payload)?
            ),
            None => println!("No job found for {}", id),
        }
        return Ok(());
    }

    if let Some(state) = parse_state(state)? {
        for job in store.list(Some(state))? {
            println!("{}\t{}/{}\t{}", job.id, job.attempts, job.max_attempts, job.last_error.as_deref().unwrap_or(""));
        }
        return Ok(());
    }

    for (state, count) in store.counts()? {
        println!("{:<10} {}", state, count);
    }
    Ok(())
}
