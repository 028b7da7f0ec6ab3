use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure talking to the chain. Retried with backoff.
    #[error("event source unavailable: {0}")]
    SourceUnavailable(String),

    /// Feed entry that can never become a CanonicalEvent. Dropped, never enqueued.
    #[error("malformed event in tx {tx_hash}: {reason}")]
    MalformedEvent { tx_hash: String, reason: String },

    #[error("invalid transaction hash '{0}'")]
    InvalidIdentity(String),

    /// Reported by the job handler; counts against the job's attempt budget.
    #[error("processing failed: {0}")]
    ProcessingFailure(String),

    #[error("queue store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job {0} is not leased")]
    JobNotActive(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SourceUnavailable(_))
    }

    /// Data-level errors affect a single feed entry and must not stop the pipeline.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedEvent { .. } | Error::InvalidIdentity(_)
        )
    }
}

impl From<ethers::providers::ProviderError> for Error {
    fn from(err: ethers::providers::ProviderError) -> Self {
        Error::SourceUnavailable(err.to_string())
    }
}

impl From<ethers::providers::WsClientError> for Error {
    fn from(err: ethers::providers::WsClientError) -> Self {
        Error::SourceUnavailable(err.to_string())
    }
}
