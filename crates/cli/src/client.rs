//! HTTP client for one ad-node API

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client bound to one node
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        // Relative joins keep any path prefix only with a trailing slash
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("Invalid node URL: {}", base_url))?;

        Ok(Self { client, base_url })
    }

    /// Node URL as configured
    pub fn node(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    /// Make a GET request, failing on non-success statuses
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.get_with_status::<serde_json::Value>(path).await?;
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, body);
        }
        serde_json::from_value(body).context("Failed to parse response")
    }

    /// Make a GET request and return the status with the JSON body
    ///
    /// For endpoints that answer failures with a JSON body, such as `/healthz`.
    pub async fn get_with_status<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T)> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.node()))?;

        let status = response.status();
        let body = response.json().await.context("Failed to parse response")?;
        Ok((status, body))
    }

    /// Make a POST request with JSON body and return the status with the JSON body
    pub async fn post_with_status<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, T)> {
        let response = self
            .client
            .post(self.url(path)?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.node()))?;

        let status = response.status();
        let body = response.json().await.context("Failed to parse response")?;
        Ok((status, body))
    }
}

// API types not shared with lifecycle-lib

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub features: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerResponse {
    pub detector_id: String,
    pub owner: String,
    pub local: bool,
    pub ring_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_prefix() {
        let client = ApiClient::new("http://node-a:8080/ad").unwrap();
        assert_eq!(client.url("stats").unwrap().as_str(), "http://node-a:8080/ad/stats");
        assert_eq!(client.node(), "http://node-a:8080/ad");
    }

    #[test]
    fn test_invalid_url() {
        assert!(ApiClient::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_get_fails_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/stats/bogus")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"stat \"bogus\" does not exist","kind":"unknown_stat","retryable":false}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .get::<serde_json::Value>("stats/bogus")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_returns_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/detectors/cpu/score")
            .match_body(mockito::Matcher::Json(serde_json::json!({"features": [1.0, 2.0]})))
            .with_status(202)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"model for detector cpu is not ready","kind":"not_ready","retryable":true}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let (status, body): (StatusCode, ErrorResponse) = client
            .post_with_status(
                "detectors/cpu/score",
                &ScoreRequest {
                    features: vec![1.0, 2.0],
                },
            )
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.kind, "not_ready");
        assert!(body.retryable);
    }
}
