use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Address, Filter, Log, H256, U256};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{sort_feed_order, EventSource};
use crate::error::{Error, Result};
use crate::models::RawEvent;
use crate::retry::{with_retry, Backoff};

/// ERC-721 Transfer; `from`, `to` and `tokenId` are all indexed topics.
const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

const LIVE_BUFFER: usize = 1024;
const CATCH_UP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ChainSourceConfig {
    /// Upper bound on blocks per `eth_getLogs` call.
    pub block_span: u64,
    /// Delay between resubscribe attempts after the websocket drops.
    pub reconnect: Backoff,
}

impl Default for ChainSourceConfig {
    fn default() -> Self {
        Self {
            block_span: 2_000,
            reconnect: Backoff::default(),
        }
    }
}

/// Transfer logs of one contract, read over a websocket JSON-RPC endpoint.
pub struct ChainEventSource {
    provider: Arc<Provider<Ws>>,
    filter: Filter,
    config: ChainSourceConfig,
}

impl ChainEventSource {
    pub async fn connect(ws_url: &str, contract: Address, config: ChainSourceConfig) -> Result<Self> {
        let ws = Ws::connect(ws_url).await?;
        let provider = Arc::new(Provider::new(ws));
        info!("connected to {} for contract {:#x}", ws_url, contract);

        Ok(Self {
            provider,
            filter: Filter::new().address(contract).event(TRANSFER_EVENT),
            config,
        })
    }
}

#[async_trait]
impl EventSource for ChainEventSource {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn fetch_historical(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        fetch_range(&self.provider, &self.filter, from_block, to_block, self.config.block_span).await
    }

    async fn subscribe_live(&self) -> Result<BoxStream<'static, RawEvent>> {
        let head = self.head_block().await?;
        let (tx, rx) = mpsc::channel(LIVE_BUFFER);

        let feed = Arc::new(WsFeed {
            provider: self.provider.clone(),
            filter: self.filter.clone(),
            block_span: self.config.block_span,
        });
        tokio::spawn(forward_live(feed, self.config.reconnect, head, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn fetch_range(
    provider: &Provider<Ws>,
    filter: &Filter,
    from_block: u64,
    to_block: u64,
    block_span: u64,
) -> Result<Vec<RawEvent>> {
    let mut events = Vec::new();

    for (start, end) in block_chunks(from_block, to_block, block_span) {
        let logs = provider
            .get_logs(&filter.clone().from_block(start).to_block(end))
            .await?;
        debug!("fetched {} logs in blocks {}..={}", logs.len(), start, end);
        events.extend(logs.iter().filter_map(raw_from_log));
    }

    sort_feed_order(&mut events);
    Ok(events)
}

/// Split `from_block..=to_block` into inclusive ranges of at most `span` blocks.
fn block_chunks(from_block: u64, to_block: u64, span: u64) -> Vec<(u64, u64)> {
    let span = span.max(1);
    let mut chunks = Vec::new();
    let mut block = from_block;

    while block <= to_block {
        let chunk_end = block.saturating_add(span - 1).min(to_block);
        chunks.push((block, chunk_end));
        if chunk_end == u64::MAX {
            break;
        }
        block = chunk_end + 1;
    }

    chunks
}

/// Raw log subscription plus the ranged read used to catch up after it opens.
#[async_trait]
trait LogFeed: Send + Sync {
    async fn subscribe(&self) -> Result<BoxStream<'_, Log>>;

    /// Everything from `from_block` up to the current head, in feed order.
    async fn catch_up(&self, from_block: u64) -> Result<Vec<RawEvent>>;
}

struct WsFeed {
    provider: Arc<Provider<Ws>>,
    filter: Filter,
    block_span: u64,
}

#[async_trait]
impl LogFeed for WsFeed {
    async fn subscribe(&self) -> Result<BoxStream<'_, Log>> {
        Ok(Box::pin(self.provider.subscribe_logs(&self.filter).await?))
    }

    async fn catch_up(&self, from_block: u64) -> Result<Vec<RawEvent>> {
        let head = self.provider.get_block_number().await?.as_u64();
        fetch_range(&self.provider, &self.filter, from_block, head, self.block_span).await
    }
}

/// Pump the subscription into `tx` for as long as the receiver lives.
///
/// Every (re)subscription is followed by a catch-up read from the last block
/// seen, so a dropped socket costs duplicates, not gaps. Live logs are only
/// forwarded once that catch-up has succeeded; otherwise the subscription is
/// dropped and the cursor stays where it was.
async fn forward_live<F: LogFeed>(
    feed: Arc<F>,
    reconnect: Backoff,
    start_block: u64,
    tx: mpsc::Sender<RawEvent>,
) {
    let mut last_block = start_block;
    let mut failures = 0u32;

    while !tx.is_closed() {
        match feed.subscribe().await {
            Ok(mut stream) => {
                let missed = with_retry(
                    "live catch-up",
                    reconnect,
                    CATCH_UP_ATTEMPTS,
                    Error::is_retryable,
                    || feed.catch_up(last_block),
                )
                .await;

                match missed {
                    Ok(missed) => {
                        failures = 0;
                        debug!("[listener] replaying {} event(s) since block {}", missed.len(), last_block);
                        for raw in missed {
                            last_block = last_block.max(raw.block_number);
                            if tx.send(raw).await.is_err() {
                                return;
                            }
                        }

                        loop {
                            tokio::select! {
                                _ = tx.closed() => return,
                                next = stream.next() => {
                                    let Some(log) = next else { break };
                                    let Some(raw) = raw_from_log(&log) else { continue };
                                    last_block = last_block.max(raw.block_number);
                                    if tx.send(raw).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        warn!("[listener] subscription closed at block {}", last_block);
                    }
                    Err(e) => warn!(
                        "[listener] catch-up from block {} failed: {}; resubscribing",
                        last_block, e
                    ),
                }
            }
            Err(e) => warn!("[listener] subscribe failed: {}", e),
        }

        failures += 1;
        tokio::time::sleep(reconnect.delay(failures)).await;
    }
}

fn raw_from_log(log: &Log) -> Option<RawEvent> {
    if log.removed == Some(true) {
        debug!("skipping removed log in tx {:?}", log.transaction_hash);
        return None;
    }

    Some(RawEvent {
        tx_hash: log
            .transaction_hash
            .map(|h| format!("{:#x}", h))
            .unwrap_or_default(),
        from: log.topics.get(1).map(topic_address).unwrap_or_default(),
        to: log.topics.get(2).map(topic_address).unwrap_or_default(),
        token_id: log
            .topics
            .get(3)
            .map(|t| U256::from_big_endian(t.as_bytes()).to_string())
            .unwrap_or_default(),
        block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
    })
}

// topics are 32 bytes; an address is the low 20
fn topic_address(topic: &H256) -> String {
    format!("{:#x}", Address::from_slice(&topic.as_bytes()[12..]))
}
