use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::channel::protocol::decode_results;
use crate::error::FetchError;
use crate::models::{Credentials, ElectionId, ResultSet};

/// Point-in-time results read. No side effects.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_snapshot(
        &self,
        election_id: ElectionId,
        credentials: Option<&Credentials>,
    ) -> Result<ResultSet, FetchError>;
}

/// Reads results from `GET {api}/api/elections/{id}/results`.
pub struct HttpSnapshotFetcher {
    client: reqwest::Client,
    api_url: Url,
}

impl HttpSnapshotFetcher {
    pub fn new(api_url: Url, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, api_url })
    }

    fn results_url(&self, election_id: ElectionId) -> Result<Url, FetchError> {
        self.api_url
            .join(&format!("api/elections/{}/results", election_id))
            .map_err(|e| FetchError::Unavailable(format!("bad results URL: {}", e)))
    }
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch_snapshot(
        &self,
        election_id: ElectionId,
        credentials: Option<&Credentials>,
    ) -> Result<ResultSet, FetchError> {
        let credentials = credentials
            .filter(|c| c.is_valid())
            .ok_or(FetchError::Unauthorized)?;
        let url = self.results_url(election_id)?;
        debug!("Fetching results snapshot from {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, credentials.bearer())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(FetchError::Unauthorized),
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound(election_id)),
            status => {
                warn!("Results request for election {} returned {}", election_id, status);
                return Err(FetchError::Unavailable(format!("HTTP {}", status)));
            }
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        decode_results(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_url_is_built_under_the_api_root() {
        let fetcher = HttpSnapshotFetcher::new(
            Url::parse("https://vote.example.edu/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            fetcher.results_url(42).unwrap().as_str(),
            "https://vote.example.edu/api/elections/42/results"
        );
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_a_request() {
        // Unroutable address: any real request would surface as Unavailable.
        let fetcher = HttpSnapshotFetcher::new(
            Url::parse("http://127.0.0.1:9/").unwrap(),
            Duration::from_millis(50),
        )
        .unwrap();
        assert_eq!(
            fetcher.fetch_snapshot(1, None).await,
            Err(FetchError::Unauthorized)
        );
        assert_eq!(
            fetcher.fetch_snapshot(1, Some(&Credentials::new(""))).await,
            Err(FetchError::Unauthorized)
        );
    }
}
