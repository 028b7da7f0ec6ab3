//! Reconciles an ERC-721 Transfer feed with a durable, deduplicated job queue.
//!
//! ```text
//! EventSource -> normalize -> Reconciler -> Enqueuer -> SQLite queue -> Worker -> JobHandler
//! ```
//!
//! Historical and live sightings of one transaction share an identity (the
//! lowercased tx hash), so they collapse into a single job with a bounded
//! number of attempts.

pub mod config;
pub mod db;
pub mod enqueuer;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod reconciler;
pub mod retry;
pub mod source;
pub mod worker;

pub use error::{Error, Result};
