//! Home Assistant REST API client.

use crate::entities::HassEntityState;
use crate::poll::StateFetcher;
use crate::transport::{Result, TransportError};
use async_trait::async_trait;
use ingester_core::config::HomeAssistantConfig;
use reqwest::StatusCode;
use std::time::Duration;

/// Home Assistant REST API client.
#[derive(Clone)]
pub struct HassClient {
    api_base: String,
    token: String,
    http_client: reqwest::Client,
}

impl HassClient {
    /// Create a new Home Assistant client.
    pub fn new(config: &HomeAssistantConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            api_base: config.api_base(),
            token: config.access_token.clone(),
            http_client,
        })
    }

    /// Build a full API URL from a path.
    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .get(self.api_url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::AuthRejected(
                format!("{} returned {}", path, response.status()),
            )),
            status => Err(TransportError::Http(format!("{path} returned {status}"))),
        }
    }

    /// Check that the API is reachable and the token is accepted.
    pub async fn check_api(&self) -> Result<()> {
        self.get("/").await.map(|_| ())
    }

    /// Get all entity states.
    pub async fn get_states(&self) -> Result<Vec<HassEntityState>> {
        let states: Vec<HassEntityState> = self.get("/states").await?.json().await?;
        tracing::debug!(count = states.len(), "Fetched entity states");
        Ok(states)
    }
}

#[async_trait]
impl StateFetcher for HassClient {
    async fn fetch_states(&self) -> Result<Vec<HassEntityState>> {
        self.get_states().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> HomeAssistantConfig {
        HomeAssistantConfig {
            url: url.to_string(),
            access_token: "token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_api_url() {
        let client = HassClient::new(&config("http://ha.local:8123/")).unwrap();
        assert_eq!(client.api_url("/states"), "http://ha.local:8123/api/states");
        assert_eq!(client.api_url("states"), "http://ha.local:8123/api/states");
        assert_eq!(client.api_url("/"), "http://ha.local:8123/api/");
    }

    #[tokio::test]
    async fn test_unreachable_hub_is_recoverable() {
        // Port 9 on localhost is almost never listening
        let client = HassClient::new(&HomeAssistantConfig {
            request_timeout_secs: 2,
            ..config("http://127.0.0.1:9")
        })
        .unwrap();

        let err = client.get_states().await.unwrap_err();
        assert!(!err.is_fatal(), "unexpected fatal error: {err}");
    }
}
