use std::time::Duration;

use clap::{Parser, Subcommand};
use ethers::types::Address;

use crate::db::StoreConfig;
use crate::enqueuer::DEFAULT_MAX_ATTEMPTS;
use crate::error::{Error, Result};
use crate::models::JobState;
use crate::reconciler::ReconcilerConfig;
use crate::retry::Backoff;
use crate::source::ChainSourceConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// SQLite queue path
    #[arg(short, long, env = "DB_PATH", default_value = "transfers.db")]
    pub db_path: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Backfill, follow the live feed and process jobs
    Run(RunArgs),
    /// Print queue contents
    Status {
        /// Show a single job
        #[arg(long)]
        id: Option<String>,

        /// List jobs in this state (pending, active, succeeded, failed)
        #[arg(long)]
        state: Option<String>,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Websocket JSON-RPC endpoint (wss://...)
    #[arg(short, long, env = "WS_URL")]
    pub ws_url: Option<String>,

    /// ERC-721 contract to follow
    #[arg(short, long, env = "CONTRACT")]
    pub contract: Option<String>,

    /// First block of the historical backfill
    #[arg(long, default_value_t = 0)]
    pub from_block: u64,

    /// Max blocks per eth_getLogs request
    #[arg(long, default_value_t = 2_000)]
    pub block_span: u64,

    /// Source calls allowed per read before startup fails
    #[arg(long, default_value_t = 5)]
    pub backfill_retries: u32,

    /// Number of parallel workers
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Attempts per job before it fails terminally
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Seconds a leased job may run before it is handed out again
    #[arg(long, default_value_t = 30)]
    pub lease_secs: u64,

    /// First retry delay for a failed job, doubled per attempt
    #[arg(long, default_value_t = 1_000)]
    pub retry_initial_ms: u64,

    /// Worker poll interval when the queue is empty
    #[arg(long, default_value_t = 500)]
    pub poll_ms: u64,

    /// Prune succeeded jobs older than this many hours. 0 keeps them forever.
    /// A pruned transfer is enqueued again if a later backfill sees it.
    #[arg(long, default_value_t = 0)]
    pub retention_hours: u64,
}

/// Validated settings for the `run` command.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub ws_url: String,
    pub contract: Address,
    pub workers: usize,
    pub max_attempts: u32,
    /// `None` keeps succeeded jobs, and with them their dedup record.
    pub retention: Option<Duration>,
    pub store: StoreConfig,
    pub source: ChainSourceConfig,
    pub reconciler: ReconcilerConfig,
    pub worker: WorkerConfig,
}

impl RunArgs {
    pub fn settings(&self) -> Result<RunSettings> {
        let ws_url = self
            .ws_url
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("provide the endpoint via --ws-url or WS_URL".to_string()))?;
        let contract = self
            .contract
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("provide the contract via --contract or CONTRACT".to_string()))?;
        let contract: Address = contract
            .parse()
            .map_err(|e| Error::Config(format!("bad contract address '{}': {}", contract, e)))?;

        if self.max_attempts == 0 {
            return Err(Error::Config("--max-attempts must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("--workers must be at least 1".to_string()));
        }

        Ok(RunSettings {
            ws_url,
            contract,
            workers: self.workers,
            max_attempts: self.max_attempts,
            retention: (self.retention_hours > 0)
                .then(|| Duration::from_secs(self.retention_hours.saturating_mul(3600))),
            store: StoreConfig {
                lease: Duration::from_secs(self.lease_secs),
                retry_backoff: Backoff {
                    initial: Duration::from_millis(self.retry_initial_ms),
                    max: Duration::from_secs(3600),
                    multiplier: 2.0,
                },
            },
            source: ChainSourceConfig {
                block_span: self.block_span.max(1),
                reconnect: Backoff::default(),
            },
            reconciler: ReconcilerConfig {
                start_block: self.from_block,
                source_backoff: Backoff::default(),
                source_attempts: self.backfill_retries.max(1),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(self.poll_ms),
            },
        })
    }
}

pub fn parse_state(state: Option<&str>) -> Result<Option<JobState>> {
    state.map(str::parse).transpose()
}
