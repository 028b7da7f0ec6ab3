//! Where raw Transfer logs come from.
//!
//! An [`EventSource`] answers two questions: what happened in a closed block
//! range, and what is happening now. The historical side is a finite ordered
//! batch; the live side is an endless stream with no ordering promise and
//! possible redelivery.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::models::RawEvent;

mod chain;
mod memory;

pub use chain::{ChainEventSource, ChainSourceConfig};
pub use memory::MemoryEventSource;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Latest block number known to the feed.
    async fn head_block(&self) -> Result<u64>;

    /// Events in `from_block..=to_block`, ordered by block then log index.
    async fn fetch_historical(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>>;

    /// Open the live feed. The stream never ends on its own.
    async fn subscribe_live(&self) -> Result<BoxStream<'static, RawEvent>>;
}

pub(crate) fn sort_feed_order(events: &mut [RawEvent]) {
    events.sort_by_key(|e| (e.block_number, e.log_index));
}
