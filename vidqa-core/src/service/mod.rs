//! Indexing/answering service
//!
//! The remote service is an opaque HTTP API with three operations:
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | ingest | `POST /ingest-url {url}` | `{title?}` |
//! | status | `GET /status/{content_id}` | `{indexed, status, chunk_count}` |
//! | ask | `POST /ask {question, video_id, session_id}` | `{answer, references: [{start}]}` |
//!
//! Coordinators depend on the [`QaService`] trait so tests can script
//! responses; [`ServiceClient`] is the HTTP implementation.

mod client;
#[cfg(test)]
pub(crate) mod testing;

pub use client::ServiceClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ContentId, IndexingStatus};

/// Response from `POST /ingest-url`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IngestResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub video_id: Option<String>,
}

/// Response from `GET /status/{content_id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub indexed: bool,
    /// "indexing", "indexed" or "failed"
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub chunk_count: u32,
}

impl StatusResponse {
    /// Interpret the report as an [`IndexingStatus`]
    pub fn to_status(&self) -> IndexingStatus {
        if self.indexed || self.status.as_deref() == Some("indexed") {
            return IndexingStatus::Indexed;
        }
        match self.status.as_deref() {
            Some("failed") => IndexingStatus::Failed,
            _ => IndexingStatus::Indexing {
                chunk_count: self.chunk_count,
            },
        }
    }
}

/// Request body for `POST /ask`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskRequest {
    pub question: String,
    pub video_id: String,
    pub session_id: String,
}

impl AskRequest {
    /// Build a request scoped to one content id (the session id is the content id)
    pub fn for_content(content_id: &ContentId, question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            video_id: content_id.to_string(),
            session_id: content_id.to_string(),
        }
    }
}

/// A supporting passage of an answer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reference {
    #[serde(alias = "start_time")]
    pub start: f64,
}

/// Response from `POST /ask`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    #[serde(default)]
    pub references: Option<Vec<Reference>>,
}

impl AskResponse {
    /// Citation offsets in the order the service returned them
    pub fn citation_offsets(&self) -> Vec<f64> {
        self.references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|r| r.start)
            .collect()
    }
}

/// Operations the synchronizer needs from the remote service
#[async_trait]
pub trait QaService: Send + Sync {
    /// Begin (idempotent) asynchronous indexing of `url`
    async fn ingest(&self, url: &str) -> Result<IngestResponse>;

    /// Current indexing progress for `content_id`
    async fn status(&self, content_id: &ContentId) -> Result<StatusResponse>;

    /// Ask a question about one piece of content
    async fn ask(&self, request: &AskRequest) -> Result<AskResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_interpretation() {
        let indexing: StatusResponse = serde_json::from_str(
            r#"{"indexed": false, "status": "indexing", "chunk_count": 12}"#,
        )
        .unwrap();
        assert_eq!(
            indexing.to_status(),
            IndexingStatus::Indexing { chunk_count: 12 }
        );

        let done: StatusResponse =
            serde_json::from_str(r#"{"indexed": true, "chunk_count": 40}"#).unwrap();
        assert_eq!(done.to_status(), IndexingStatus::Indexed);

        let failed: StatusResponse =
            serde_json::from_str(r#"{"indexed": false, "status": "failed", "chunk_count": 0}"#)
                .unwrap();
        assert_eq!(failed.to_status(), IndexingStatus::Failed);
    }

    #[test]
    fn test_citation_offsets_keep_service_order() {
        let response: AskResponse = serde_json::from_str(
            r#"{"answer": "x", "references": [{"start": 90}, {"start_time": 5.5}, {"start": 30}]}"#,
        )
        .unwrap();
        assert_eq!(response.citation_offsets(), vec![90.0, 5.5, 30.0]);

        let bare: AskResponse = serde_json::from_str(r#"{"answer": "x"}"#).unwrap();
        assert!(bare.citation_offsets().is_empty());
    }
}
