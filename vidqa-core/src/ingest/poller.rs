//! Indexing status polling for one content id

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result};
use crate::service::QaService;
use crate::store::SessionStore;
use crate::types::{ContentId, IndexingStatus, LastError};

/// How a polling loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Indexed,
    Failed,
    Cancelled,
}

/// Polls `GET /status/{id}` until the content reaches a terminal status.
pub(crate) struct StatusPoller {
    pub(crate) store: SessionStore,
    pub(crate) service: Arc<dyn QaService>,
    pub(crate) content_id: ContentId,
    pub(crate) interval: Duration,
}

impl StatusPoller {
    pub(crate) async fn run(self, cancel: CancellationToken) -> PollOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(content_id = %self.content_id, error = %e, "Status poll failed");
                }
            }
        }
    }

    /// One status round trip. `Some` once the status is terminal.
    async fn poll_once(&self) -> Result<Option<PollOutcome>> {
        let report = match self.service.status(&self.content_id).await {
            Ok(report) => report,
            Err(e) => {
                self.report_unreachable(&e.to_string())?;
                return Ok(None);
            }
        };

        let stored = self
            .store
            .advance_status(&self.content_id, report.to_status())?;

        match stored {
            IndexingStatus::Indexed => {
                tracing::info!(content_id = %self.content_id, chunks = report.chunk_count, "Video indexed");
                self.store.clear_error_for(&self.content_id)?;
                Ok(Some(PollOutcome::Indexed))
            }
            IndexingStatus::Failed => {
                self.store.record_error(LastError::new(
                    Some(self.content_id.clone()),
                    ErrorKind::IndexingFailed,
                    format!(
                        "Failed to index video: {}. Does the video have captions?",
                        self.content_id
                    ),
                ))?;
                Ok(Some(PollOutcome::Failed))
            }
            IndexingStatus::Indexing { .. } | IndexingStatus::NotStarted => {
                self.store.clear_error_for(&self.content_id)?;
                Ok(None)
            }
        }
    }

    /// Surface an unreachable service once, not on every tick
    fn report_unreachable(&self, detail: &str) -> Result<()> {
        let already_reported = self.store.last_error()?.is_some_and(|err| {
            err.kind == ErrorKind::NetworkError
                && err.content_id.as_ref() == Some(&self.content_id)
        });
        if already_reported {
            return Ok(());
        }
        self.store.record_error(LastError::new(
            Some(self.content_id.clone()),
            ErrorKind::NetworkError,
            format!("Could not check video status: {}", detail),
        ))
    }
}
