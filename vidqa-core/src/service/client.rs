//! HTTP client for the indexing/answering service

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::types::ContentId;

use super::{AskRequest, AskResponse, IngestResponse, QaService, StatusResponse};

/// Request body for POST /ingest-url
#[derive(Serialize)]
struct IngestRequest<'a> {
    url: &'a str,
}

/// HTTP client for the service API
#[derive(Clone)]
pub struct ServiceClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl ServiceClient {
    /// Create a new client from configuration
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("service.base_url is required".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the service answers at all
    pub async fn health_check(&self) -> bool {
        match self.http_client.get(&self.base_url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("failed to parse response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Network(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }
}

#[async_trait]
impl QaService for ServiceClient {
    async fn ingest(&self, url: &str) -> Result<IngestResponse> {
        let endpoint = format!("{}/ingest-url", self.base_url);
        tracing::debug!(url, "Requesting ingestion");

        let response = self
            .http_client
            .post(&endpoint)
            .json(&IngestRequest { url })
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        Self::decode(response).await
    }

    async fn status(&self, content_id: &ContentId) -> Result<StatusResponse> {
        let endpoint = format!(
            "{}/status/{}",
            self.base_url,
            urlencoding::encode(content_id.as_str())
        );

        let response = self
            .http_client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        Self::decode(response).await
    }

    async fn ask(&self, request: &AskRequest) -> Result<AskResponse> {
        let endpoint = format!("{}/ask", self.base_url);
        tracing::debug!(video_id = %request.video_id, "Sending question");

        let response = self
            .http_client
            .post(&endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        Self::decode(response).await
    }
}
