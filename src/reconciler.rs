//! Backfill, then follow.
//!
//! The historical window `[start_block, head]` is fetched and enqueued in feed
//! order before the live feed is opened. Once subscribed, blocks that landed
//! between the backfill head and the subscription are fetched once more, so the
//! handoff leaves no gap; the overlap is absorbed by enqueue dedup.

use std::sync::Arc;

use futures::StreamExt;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::db::InsertOutcome;
use crate::enqueuer::Enqueuer;
use crate::error::{Error, Result};
use crate::models::{EventOrigin, RawEvent};
use crate::normalizer::normalize;
use crate::retry::{with_retry, Backoff};
use crate::source::EventSource;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// First block of the historical window.
    pub start_block: u64,
    pub source_backoff: Backoff,
    /// Calls allowed per source read or enqueue before the run is abandoned.
    pub source_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            source_backoff: Backoff::default(),
            source_attempts: 5,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub seen: u64,
    pub enqueued: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

impl IngestStats {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Created | InsertOutcome::Requeued => self.enqueued += 1,
            InsertOutcome::Duplicate(_) => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backfill {
    /// Chain head read at startup; the last block covered by the backfill.
    pub range_end: u64,
    pub stats: IngestStats,
}

pub struct Reconciler {
    source: Arc<dyn EventSource>,
    enqueuer: Enqueuer,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(source: Arc<dyn EventSource>, enqueuer: Enqueuer, config: ReconcilerConfig) -> Self {
        Self {
            source,
            enqueuer,
            config,
        }
    }

    /// Backfill and then follow the live feed until `shutdown` fires.
    ///
    /// Startup failures, an enqueue that keeps failing after retries, and
    /// the live feed ending are returned as errors.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<IngestStats> {
        let backfill = self.backfill().await?;
        let live = self.follow_live(backfill.range_end, shutdown).await?;

        Ok(IngestStats {
            seen: backfill.stats.seen + live.seen,
            enqueued: backfill.stats.enqueued + live.enqueued,
            duplicates: backfill.stats.duplicates + live.duplicates,
            dropped: backfill.stats.dropped + live.dropped,
        })
    }

    pub async fn backfill(&self) -> Result<Backfill> {
        info!("[bootstrap] starting up.");
        let range_end = self.head().await?;
        let mut stats = IngestStats::default();

        if self.config.start_block > range_end {
            warn!(
                "[bootstrap] start block {} is past head {}, nothing to backfill.",
                self.config.start_block, range_end
            );
            return Ok(Backfill { range_end, stats });
        }

        info!(
            "[bootstrap] fetching transfers in blocks {}..={}.",
            self.config.start_block, range_end
        );
        let events = self.fetch(self.config.start_block, range_end).await?;
        info!("[bootstrap] found {} transfers.", events.len());

        for raw in &events {
            self.ingest(raw, EventOrigin::Bootstrap, &mut stats).await?;
        }

        info!("[bootstrap] complete: {:?}.", stats);
        Ok(Backfill { range_end, stats })
    }

    async fn follow_live(&self, range_end: u64, shutdown: CancellationToken) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        let mut live = with_retry(
            "live subscription",
            self.config.source_backoff,
            self.config.source_attempts,
            Error::is_retryable,
            || self.source.subscribe_live(),
        )
        .await?;
        info!("[listener] subscribed.");

        let head = self.head().await?;
        if head > range_end {
            let gap = self.fetch(range_end + 1, head).await?;
            info!(
                "[listener] {} transfer(s) landed in blocks {}..={} during backfill.",
                gap.len(),
                range_end + 1,
                head
            );
            for raw in &gap {
                self.ingest(raw, EventOrigin::Bootstrap, &mut stats).await?;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("[listener] shutting down: {:?}.", stats);
                    return Ok(stats);
                }
                next = live.next() => {
                    let Some(raw) = next else {
                        return Err(Error::SourceUnavailable("live feed ended".to_string()));
                    };
                    self.ingest(&raw, EventOrigin::Listener, &mut stats).await?;
                }
            }
        }
    }

    /// Normalize and enqueue one entry. Malformed entries are logged and
    /// dropped. Store errors are retried; they only come back once the
    /// attempt budget is spent.
    async fn ingest(&self, raw: &RawEvent, origin: EventOrigin, stats: &mut IngestStats) -> Result<()> {
        stats.seen += 1;
        let event = match normalize(raw) {
            Ok(event) => event,
            Err(e) if e.is_data_error() => {
                warn!("[{}] dropping event at block {}: {}", origin, raw.block_number, e);
                stats.dropped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcome = with_retry(
            "enqueue",
            self.config.source_backoff,
            self.config.source_attempts,
            |e: &Error| matches!(e, Error::Store(_)),
            || self.enqueuer.enqueue(&event, origin),
        )
        .await?;
        stats.record(outcome);
        Ok(())
    }

    async fn head(&self) -> Result<u64> {
        with_retry(
            "head block read",
            self.config.source_backoff,
            self.config.source_attempts,
            Error::is_retryable,
            || self.source.head_block(),
        )
        .await
    }

    async fn fetch(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        with_retry(
            "historical fetch",
            self.config.source_backoff,
            self.config.source_attempts,
            Error::is_retryable,
            || self.source.fetch_historical(from_block, to_block),
        )
        .await
    }
}
