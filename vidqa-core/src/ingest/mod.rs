//! Ingestion Coordinator
//!
//! Turns observed page locations into (de-duplicated) ingest requests and
//! drives each content's indexing status to a terminal state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │ Location events │ ──► │ IngestCoordinator│ ──► │  SessionStore   │
//! │  (url, title)   │     │                  │     │ (claims, status)│
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────────┐
//!                    │  QaService           │
//!                    │  ├─ POST /ingest-url │
//!                    │  └─ GET /status/{id} │
//!                    └──────────────────────┘
//! ```
//!
//! Per content: `NotStarted → Indexing{chunk_count} → Indexed | Failed`.
//! A request is issued only when the url's persisted claim can be taken, so
//! repeated observations (or a restart) do not repeat it. Claims left by an
//! earlier process expire after `ingest.claim_ttl_secs`; within one process a
//! url is requested at most once until it is released or re-ingested. A transport failure
//! of the request releases the claim and is reported through `lastError`; it
//! does not move the status.

mod poller;

pub use poller::PollOutcome;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::content::{self, DEFAULT_TITLE};
use crate::error::{Error, Result};
use crate::service::QaService;
use crate::store::SessionStore;
use crate::types::{ContentId, IndexingStatus, LastError, PageLocation, SessionDefaults};

use poller::StatusPoller;

/// What [`IngestCoordinator::observe`] did with a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// The page has no content reference
    NoContent,
    /// A new ingest request was issued
    Requested(ContentId),
    /// The url was already claimed; polling (if needed) was resumed
    AlreadyRequested(ContentId),
    /// The content is already terminal; nothing to do
    Settled(ContentId, IndexingStatus),
}

struct PollerSlot {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    store: SessionStore,
    service: Arc<dyn QaService>,
    status_interval: Duration,
    claim_ttl: Duration,
    /// Urls this process has requested and not released
    requested: Mutex<HashSet<String>>,
    pollers: Mutex<HashMap<ContentId, PollerSlot>>,
    next_generation: Mutex<u64>,
    shutdown: CancellationToken,
}

/// Coordinates ingest requests and status polling. Cheap to clone.
#[derive(Clone)]
pub struct IngestCoordinator {
    inner: Arc<Inner>,
}

impl IngestCoordinator {
    pub fn new(store: SessionStore, service: Arc<dyn QaService>, config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                service,
                status_interval: config.polling.status_interval(),
                claim_ttl: config.ingest.claim_ttl(),
                requested: Mutex::new(HashSet::new()),
                pollers: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Handle one observed location.
    pub fn observe(&self, location: &PageLocation) -> Result<ObserveOutcome> {
        let store = &self.inner.store;
        let title = content::normalize_title(&location.title);
        store.set_location(&PageLocation::new(location.url.clone(), title.clone()))?;

        let Some(content_id) = content::content_id_from_url(&location.url) else {
            tracing::debug!(url = %location.url, "No content on page");
            return Ok(ObserveOutcome::NoContent);
        };

        let session = store.get_or_create(
            &content_id,
            SessionDefaults {
                title: title.clone(),
                url: location.url.clone(),
            },
        )?;
        if session.title != title && title != DEFAULT_TITLE {
            store.update(&content_id, |s| s.title = title)?;
        }
        store.set_active_session(&content_id)?;

        let status = store.indexing_status(&content_id)?;
        if status.is_terminal() {
            return Ok(ObserveOutcome::Settled(content_id, status));
        }

        if self.claim(&location.url)? {
            store.advance_status(&content_id, IndexingStatus::Indexing { chunk_count: 0 })?;
            self.ensure_polling(&content_id);
            self.spawn_ingest(content_id.clone(), location.url.clone());
            Ok(ObserveOutcome::Requested(content_id))
        } else {
            tracing::debug!(url = %location.url, "Ingest already requested");
            self.ensure_polling(&content_id);
            Ok(ObserveOutcome::AlreadyRequested(content_id))
        }
    }

    /// Explicitly re-ingest `location`: reset its status and claim, then
    /// observe it afresh.
    pub fn reingest(&self, location: &PageLocation) -> Result<ObserveOutcome> {
        let content_id =
            content::content_id_from_url(&location.url).ok_or(Error::NoContentDetected)?;

        self.stop_polling(&content_id);
        self.inner.store.reset_status(&content_id)?;
        self.release(&location.url)?;
        tracing::info!(content_id = %content_id, "Re-ingesting");

        self.observe(location)
    }

    /// Whether a status poller is running for `content_id`
    pub fn is_polling(&self, content_id: &ContentId) -> bool {
        self.inner
            .pollers
            .lock()
            .map(|pollers| pollers.contains_key(content_id))
            .unwrap_or(false)
    }

    /// Cancel every polling loop and pending ingest request
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Take the url for one ingest request, in this process and in the store
    fn claim(&self, url: &str) -> Result<bool> {
        let mut requested = self
            .inner
            .requested
            .lock()
            .map_err(|_| Error::StoreUnavailable("ingest claims poisoned".to_string()))?;
        if requested.contains(url) {
            return Ok(false);
        }
        if !self.inner.store.claim_ingest(url, self.inner.claim_ttl)? {
            return Ok(false);
        }
        requested.insert(url.to_string());
        Ok(true)
    }

    fn release(&self, url: &str) -> Result<()> {
        if let Ok(mut requested) = self.inner.requested.lock() {
            requested.remove(url);
        }
        self.inner.store.release_ingest(url)?;
        Ok(())
    }

    /// Fire-and-forget ingest request
    fn spawn_ingest(&self, content_id: ContentId, url: String) {
        let this = self.clone();
        let cancel = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = this.inner.service.ingest(&url) => response,
            };
            if let Err(e) = this.finish_ingest(&content_id, &url, response) {
                tracing::warn!(content_id = %content_id, error = %e, "Failed to record ingest result");
            }
        });
    }

    fn finish_ingest(
        &self,
        content_id: &ContentId,
        url: &str,
        response: Result<crate::service::IngestResponse>,
    ) -> Result<()> {
        let store = &self.inner.store;
        match response {
            Ok(response) => {
                tracing::info!(content_id = %content_id, "Ingest request accepted");
                if let Some(title) = response.title.as_deref().map(content::normalize_title) {
                    if title != DEFAULT_TITLE {
                        store.update(content_id, |s| s.title = title)?;
                    }
                }
            }
            Err(e) => {
                // Leave the status alone; the url can be retried on the next visit
                self.release(url)?;
                self.stop_polling(content_id);
                store.record_error(LastError::new(
                    Some(content_id.clone()),
                    e.kind(),
                    format!("Could not request indexing: {}", e),
                ))?;
            }
        }
        Ok(())
    }

    fn ensure_polling(&self, content_id: &ContentId) {
        let Ok(mut pollers) = self.inner.pollers.lock() else {
            return;
        };
        if pollers.contains_key(content_id) {
            return;
        }

        let generation = match self.inner.next_generation.lock() {
            Ok(mut next) => {
                *next += 1;
                *next
            }
            Err(_) => return,
        };
        let cancel = self.inner.shutdown.child_token();
        pollers.insert(
            content_id.clone(),
            PollerSlot {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(pollers);

        let poller = StatusPoller {
            store: self.inner.store.clone(),
            service: self.inner.service.clone(),
            content_id: content_id.clone(),
            interval: self.inner.status_interval,
        };
        let this = self.clone();
        let content_id = content_id.clone();

        tracing::debug!(content_id = %content_id, "Starting status poller");
        tokio::spawn(async move {
            let outcome = poller.run(cancel).await;
            tracing::debug!(content_id = %content_id, ?outcome, "Status poller finished");
            this.forget_poller(&content_id, generation);
        });
    }

    fn stop_polling(&self, content_id: &ContentId) {
        if let Ok(mut pollers) = self.inner.pollers.lock() {
            if let Some(slot) = pollers.remove(content_id) {
                slot.cancel.cancel();
            }
        }
    }

    fn forget_poller(&self, content_id: &ContentId, generation: u64) {
        if let Ok(mut pollers) = self.inner.pollers.lock() {
            if pollers
                .get(content_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                pollers.remove(content_id);
            }
        }
    }
}
