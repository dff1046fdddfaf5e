use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("failed to create request: {0}")]
    Request(String),
    #[error("failed to execute request: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("scrape endpoint returned {status}")]
    Status { status: reqwest::StatusCode },
    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
    #[error("request cancelled in flight")]
    Cancelled,
}

/// Which step of a batch insert failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    Begin,
    Prepare,
    Insert,
    Commit,
}

impl std::fmt::Display for TxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            TxStep::Begin => "begin transaction",
            TxStep::Prepare => "prepare",
            TxStep::Insert => "insert",
            TxStep::Commit => "commit",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum RelationalError {
    #[error("postgres connection string not set")]
    NotConnected,
    #[error("failed to connect to db: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("writer not prepared")]
    NotPrepared,
    #[error("failed to load sensors: {0}")]
    Query(#[source] sqlx::Error),
    #[error("failed to {step}: {source}")]
    Transaction {
        step: TxStep,
        #[source]
        source: sqlx::Error,
    },
}

impl RelationalError {
    pub fn tx(step: TxStep) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| RelationalError::Transaction { step, source }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to create producer: {0}")]
    ProducerCreation(String),
    #[error("failed to enqueue message: {0}")]
    Publish(String),
    #[error("failed to marshal readings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// First hard failure of a tick. Always terminal for the loop.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("failed to scrape: {0}")]
    Scrape(#[from] ScrapeError),
    #[error("failed to write to db: {0}")]
    Relational(#[from] RelationalError),
    #[error("failed to write to broker: {0}")]
    Broker(#[from] BrokerError),
}
