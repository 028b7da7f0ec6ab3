use std::fmt;
use std::str::FromStr;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A Transfer log as it came off the feed, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    /// Decimal (or `0x` hex) rendering of the token id; validated by the normalizer.
    pub token_id: String,
    pub block_number: u64,
    pub log_index: u64,
}

/// One observed transfer. Equal `identity` means the same on-chain occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub identity: String,
    pub from: String,
    pub to: String,
    pub token_id: U256,
}

/// Where a sighting came from. Only used for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Bootstrap,
    Listener,
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventOrigin::Bootstrap => f.write_str("bootstrap"),
            EventOrigin::Listener => f.write_str("listener"),
        }
    }
}

/// Derive the dedup key for a transaction hash: the lowercased hash.
///
/// Accepts `0x` followed by at least one hex digit, in any case.
pub fn identity_of(tx_hash: &str) -> Result<String> {
    let digits = tx_hash
        .strip_prefix("0x")
        .or_else(|| tx_hash.strip_prefix("0X"))
        .ok_or_else(|| Error::InvalidIdentity(tx_hash.to_string()))?;

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidIdentity(tx_hash.to_string()));
    }

    Ok(tx_hash.to_ascii_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Active,
    Succeeded,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Active,
        JobState::Succeeded,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::Config(format!("unknown job state '{}'", other))),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record wrapping a CanonicalEvent. `id` always equals `payload.identity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: String,
    pub payload: CanonicalEvent,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub last_error: Option<String>,
}
