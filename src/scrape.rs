use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::exposition::{parse_exposition, UnitScaling};
use crate::readings::ReadingSet;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

/// Pulls the exposition endpoint once per call. No retries.
pub struct Scraper {
    client: Client,
    endpoint: String,
    scaling: UnitScaling,
}

impl Scraper {
    pub fn new(config: &ScrapeConfig) -> Result<Self, ScrapeError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ScrapeError::Request(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.address.clone(),
            scaling: config.scaling.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn scrape(&self, cancel: &CancellationToken) -> Result<ReadingSet, ScrapeError> {
        let request = self
            .client
            .get(&self.endpoint)
            .build()
            .map_err(|err| ScrapeError::Request(err.to_string()))?;
        if cancel.is_cancelled() {
            return Err(ScrapeError::Request("cancelled before send".to_string()));
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScrapeError::Cancelled),
            body = self.fetch(request) => body?,
        };

        let readings = parse_exposition(&body, &self.scaling);
        tracing::debug!(endpoint = %self.endpoint, count = readings.len(), "scraped readings");
        Ok(readings)
    }

    async fn fetch(&self, request: reqwest::Request) -> Result<String, ScrapeError> {
        let response = self
            .client
            .execute(request)
            .await
            .map_err(ScrapeError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status { status });
        }
        response.text().await.map_err(ScrapeError::Body)
    }
}
