//! Scripted in-process service for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::ContentId;

use super::{AskRequest, AskResponse, IngestResponse, QaService, Reference, StatusResponse};

pub(crate) fn indexing(chunk_count: u32) -> Option<StatusResponse> {
    Some(StatusResponse {
        indexed: false,
        status: Some("indexing".to_string()),
        chunk_count,
    })
}

pub(crate) fn indexed(chunk_count: u32) -> Option<StatusResponse> {
    Some(StatusResponse {
        indexed: true,
        status: Some("indexed".to_string()),
        chunk_count,
    })
}

pub(crate) fn failed() -> Option<StatusResponse> {
    Some(StatusResponse {
        indexed: false,
        status: Some("failed".to_string()),
        chunk_count: 0,
    })
}

/// Status replies are consumed in order; the last one repeats. `None`
/// stands for an unreachable service.
#[derive(Default)]
pub(crate) struct ScriptedService {
    pub(crate) ingested: Mutex<Vec<String>>,
    pub(crate) asked: Mutex<Vec<AskRequest>>,
    statuses: Mutex<VecDeque<Option<StatusResponse>>>,
    answers: Mutex<HashMap<String, (Duration, Option<AskResponse>)>>,
    ingest_title: Mutex<Option<String>>,
    ingest_down: AtomicBool,
}

impl ScriptedService {
    pub(crate) fn with_statuses(statuses: Vec<Option<StatusResponse>>) -> Self {
        let service = Self::default();
        *service.statuses.lock().unwrap() = statuses.into();
        service
    }

    pub(crate) fn answer(&self, question: &str, delay: Duration, answer: &str, starts: &[f64]) {
        let response = AskResponse {
            answer: answer.to_string(),
            references: Some(starts.iter().map(|&start| Reference { start }).collect()),
        };
        self.answers
            .lock()
            .unwrap()
            .insert(question.to_string(), (delay, Some(response)));
    }

    pub(crate) fn fail_question(&self, question: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(question.to_string(), (Duration::ZERO, None));
    }

    pub(crate) fn set_ingest_title(&self, title: &str) {
        *self.ingest_title.lock().unwrap() = Some(title.to_string());
    }

    pub(crate) fn set_ingest_down(&self, down: bool) {
        self.ingest_down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn ingest_count(&self) -> usize {
        self.ingested.lock().unwrap().len()
    }
}

#[async_trait]
impl QaService for ScriptedService {
    async fn ingest(&self, url: &str) -> Result<IngestResponse> {
        self.ingested.lock().unwrap().push(url.to_string());
        if self.ingest_down.load(Ordering::SeqCst) {
            return Err(Error::Network("connection refused".to_string()));
        }
        Ok(IngestResponse {
            title: self.ingest_title.lock().unwrap().clone(),
            video_id: None,
        })
    }

    async fn status(&self, _content_id: &ContentId) -> Result<StatusResponse> {
        let next = {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop_front().flatten()
            } else {
                statuses.front().cloned().flatten()
            }
        };
        next.ok_or_else(|| Error::Network("connection refused".to_string()))
    }

    async fn ask(&self, request: &AskRequest) -> Result<AskResponse> {
        self.asked.lock().unwrap().push(request.clone());
        let scripted = self.answers.lock().unwrap().get(&request.question).cloned();
        let (delay, response) = scripted.unwrap_or((
            Duration::ZERO,
            Some(AskResponse {
                answer: format!("answer to {}", request.question),
                references: None,
            }),
        ));
        tokio::time::sleep(delay).await;
        response.ok_or_else(|| Error::Network("API error (500): boom".to_string()))
    }
}
