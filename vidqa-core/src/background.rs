//! Background context
//!
//! Owns the coordinators and answers requests arriving over the message
//! channel. Long-running requests (`ASK`) are handled on their own task so a
//! slow answer never holds up `GET_STATE` or navigation updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{AskReply, Envelope, ReplyError, Request, Response, StateReply};
use crate::content;
use crate::error::{Error, Result};
use crate::ingest::IngestCoordinator;
use crate::observer::HostPage;
use crate::query::QueryCoordinator;
use crate::store::{MigrationOutcome, SessionStore};
use crate::types::{ContentId, IndexingStatus, PageLocation};

/// Playback control offered by the host
pub trait PlayerControl: Send + Sync {
    /// Move playback to `seconds` from the start
    fn seek(&self, seconds: f64) -> Result<()>;
}

/// Request dispatcher for the background context
#[derive(Clone)]
pub struct Background {
    store: SessionStore,
    ingest: IngestCoordinator,
    queries: QueryCoordinator,
    host: Arc<dyn HostPage>,
    player: Arc<dyn PlayerControl>,
    legacy_pending: Arc<AtomicBool>,
}

impl Background {
    pub fn new(
        store: SessionStore,
        ingest: IngestCoordinator,
        queries: QueryCoordinator,
        host: Arc<dyn HostPage>,
        player: Arc<dyn PlayerControl>,
    ) -> Self {
        Self {
            store,
            ingest,
            queries,
            host,
            player,
            legacy_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Move a legacy conversation into a session keyed by `location`.
    ///
    /// When the page has no content yet, the attempt is repeated on the next
    /// observed location.
    pub fn migrate_legacy(&self, location: Option<&PageLocation>) -> Result<MigrationOutcome> {
        let fallback = PageLocation::default();
        let outcome = self
            .store
            .migrate_legacy(location.unwrap_or(&fallback))?;
        self.legacy_pending
            .store(outcome == MigrationOutcome::NoContent, Ordering::SeqCst);
        Ok(outcome)
    }

    /// Serve requests until `cancel` fires or every client is gone
    pub async fn serve(self, mut requests: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        tracing::debug!("Background context started");
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = requests.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            match envelope.request {
                Request::Ask { query, session_id } => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let reply = this.handle_ask(&query, session_id).await;
                        if let Some(slot) = envelope.reply {
                            let _ = slot.send(Response::Ask(reply));
                        }
                    });
                }
                request => {
                    let response = self.handle(request);
                    if let (Some(slot), Some(response)) = (envelope.reply, response) {
                        let _ = slot.send(response);
                    }
                }
            }
        }
        tracing::debug!("Background context stopped");
    }

    /// Handle every request except `ASK`; `None` for fire-and-forget ones
    fn handle(&self, request: Request) -> Option<Response> {
        match request {
            Request::GetState => Some(Response::State(self.stored_state())),
            Request::GetCurrentTabUrl => Some(Response::State(self.current_tab())),
            Request::UrlChanged { url, title } => {
                self.url_changed(PageLocation::new(url, title));
                None
            }
            Request::JumpToTime { seconds } => {
                if let Err(e) = self.player.seek(seconds) {
                    tracing::warn!(seconds, error = %e, "Seek failed");
                }
                None
            }
            Request::Ask { .. } => None,
        }
    }

    fn url_changed(&self, location: PageLocation) {
        if self.legacy_pending.load(Ordering::SeqCst) {
            if let Err(e) = self.migrate_legacy(Some(&location)) {
                tracing::warn!(error = %e, "Legacy migration failed");
            }
        }
        match self.ingest.observe(&location) {
            Ok(outcome) => tracing::debug!(url = %location.url, ?outcome, "Observed location"),
            Err(e) => tracing::warn!(url = %location.url, error = %e, "Failed to handle location"),
        }
    }

    fn status_for(&self, url: Option<&str>) -> IndexingStatus {
        url.and_then(content::content_id_from_url)
            .and_then(|id| self.store.indexing_status(&id).ok())
            .unwrap_or_default()
    }

    fn stored_state(&self) -> StateReply {
        match self.store.location() {
            Ok(location) => {
                let url = location.as_ref().map(|l| l.url.clone());
                StateReply {
                    status: self.status_for(url.as_deref()),
                    url,
                    title: location.map(|l| l.title),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stored location");
                StateReply::default()
            }
        }
    }

    fn current_tab(&self) -> StateReply {
        let location = self.host.current_location();
        let url = location.as_ref().map(|l| l.url.clone());
        StateReply {
            status: self.status_for(url.as_deref()),
            url,
            title: location.map(|l| content::normalize_title(&l.title)),
        }
    }

    async fn handle_ask(&self, query: &str, session_id: Option<ContentId>) -> AskReply {
        match self.ask(query, session_id).await {
            Ok(()) => AskReply::default(),
            Err(e) => AskReply {
                error: Some(ReplyError::from(&e)),
            },
        }
    }

    async fn ask(&self, query: &str, session_id: Option<ContentId>) -> Result<()> {
        let content_id = match session_id {
            Some(id) => id,
            None => self
                .store
                .location()?
                .and_then(|l| content::content_id_from_url(&l.url))
                .ok_or(Error::NoContentDetected)?,
        };
        self.queries.ask(&content_id, query).await.map(|_| ())
    }
}
