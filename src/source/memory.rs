use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{sort_feed_order, EventSource};
use crate::error::{Error, Result};
use crate::models::RawEvent;

/// Scripted in-process feed for tests and local runs.
///
/// History is served from a fixed list; live events are whatever gets pushed
/// into the sender returned by [`MemoryEventSource::new`]. Like a real
/// subscription it can only be opened once.
pub struct MemoryEventSource {
    head: AtomicU64,
    history: Vec<RawEvent>,
    live: Mutex<Option<mpsc::UnboundedReceiver<RawEvent>>>,
    outages: AtomicU32,
    fetches: AtomicU32,
}

impl MemoryEventSource {
    pub fn new(head: u64, history: Vec<RawEvent>) -> (Self, mpsc::UnboundedSender<RawEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            head: AtomicU64::new(head),
            history,
            live: Mutex::new(Some(rx)),
            outages: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
        };
        (source, tx)
    }

    /// Make the next `n` historical fetches fail with `SourceUnavailable`.
    pub fn fail_next_fetches(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Number of `fetch_historical` calls so far, failed ones included.
    pub fn fetch_calls(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_historical(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(Error::SourceUnavailable("scripted outage".to_string()));
        }

        let mut events: Vec<RawEvent> = self
            .history
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect();
        sort_feed_order(&mut events);
        Ok(events)
    }

    async fn subscribe_live(&self) -> Result<BoxStream<'static, RawEvent>> {
        let rx = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::SourceUnavailable("live feed already subscribed".to_string()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn at(block: u64, index: u64, tx: &str) -> RawEvent {
        RawEvent {
            tx_hash: tx.to_string(),
            from: "0xa".to_string(),
            to: "0xb".to_string(),
            token_id: "1".to_string(),
            block_number: block,
            log_index: index,
        }
    }

    #[tokio::test]
    async fn history_is_range_filtered_and_ordered() {
        let (source, _tx) = MemoryEventSource::new(
            10,
            vec![at(5, 1, "0x3"), at(2, 0, "0x1"), at(5, 0, "0x2"), at(11, 0, "0x4")],
        );
        let hashes: Vec<_> = source
            .fetch_historical(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.tx_hash)
            .collect();
        assert_eq!(hashes, vec!["0x1", "0x2", "0x3"]);
    }

    #[tokio::test]
    async fn scripted_outages_then_recovery() {
        let (source, _tx) = MemoryEventSource::new(1, vec![at(1, 0, "0x1")]);
        source.fail_next_fetches(2);
        assert!(source.fetch_historical(0, 1).await.is_err());
        assert!(source.fetch_historical(0, 1).await.is_err());
        assert_eq!(source.fetch_historical(0, 1).await.unwrap().len(), 1);
        assert_eq!(source.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn live_feed_opens_once() {
        let (source, tx) = MemoryEventSource::new(0, Vec::new());
        let mut live = source.subscribe_live().await.unwrap();
        tx.send(at(3, 0, "0x9")).unwrap();
        assert_eq!(live.next().await.unwrap().tx_hash, "0x9");
        assert!(source.subscribe_live().await.is_err());
    }
}
