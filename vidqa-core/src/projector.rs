//! State Projector
//!
//! The read/command surface for presentation. It follows store change
//! notifications and republishes a [`ViewState`]: the active conversation, a
//! status/error banner, a loading flag and the session list. Questions and
//! seeks go to the background context over the message channel; session
//! management commands go straight to the store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelClient;
use crate::error::{Error, ErrorKind, Result};
use crate::store::{SessionStore, StoreEvent};
use crate::types::{ContentId, GlobalState, IndexingStatus, LastError, Message, SessionRecord};

/// Status line shown above the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "banner", rename_all = "snake_case")]
pub enum Banner {
    Indexing { chunk_count: u32 },
    NotIndexed,
    Failed { content_id: ContentId },
    Error { kind: ErrorKind, message: String },
}

impl Banner {
    pub fn message(&self) -> String {
        match self {
            Banner::Indexing { chunk_count } => format!(
                "Video is being indexed ({} chunks loaded so far). Please wait...",
                chunk_count
            ),
            Banner::NotIndexed => {
                "Video not indexed yet. Please wait a moment and try again.".to_string()
            }
            Banner::Failed { content_id } => format!(
                "Failed to index video: {}. Does the video have captions?",
                content_id
            ),
            Banner::Error { message, .. } => message.clone(),
        }
    }

    fn from_state(error: Option<&LastError>, status: IndexingStatus, active: &ContentId) -> Option<Self> {
        // An error about this content (or about nothing in particular) wins
        if let Some(err) = error {
            if err.content_id.as_ref().map_or(true, |id| id == active) {
                return Some(Banner::Error {
                    kind: err.kind,
                    message: err.message.clone(),
                });
            }
        }
        match status {
            IndexingStatus::NotStarted => Some(Banner::NotIndexed),
            IndexingStatus::Indexing { chunk_count } => Some(Banner::Indexing { chunk_count }),
            IndexingStatus::Failed => Some(Banner::Failed {
                content_id: active.clone(),
            }),
            IndexingStatus::Indexed => None,
        }
    }
}

/// One row of the session list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub content_id: ContentId,
    pub title: String,
    pub url: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(session: &SessionRecord) -> Self {
        Self {
            content_id: session.content_id.clone(),
            title: session.title.clone(),
            url: session.url.clone(),
            message_count: session.conversation.len(),
            updated_at: session.updated_at,
        }
    }
}

/// Everything presentation renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewState {
    pub active_session_id: Option<ContentId>,
    pub title: Option<String>,
    pub url: Option<String>,
    /// Page the host last reported, which may differ from the session's url
    pub page_url: Option<String>,
    pub indexing_status: IndexingStatus,
    pub conversation: Vec<Message>,
    pub banner: Option<Banner>,
    /// True while any ask on the active session is still pending
    pub loading: bool,
    /// Most recently active first
    pub sessions: Vec<SessionSummary>,
}

impl ViewState {
    fn project(state: GlobalState, loading: &HashSet<ContentId>) -> Self {
        let mut sessions: Vec<SessionSummary> =
            state.sessions.values().map(SessionSummary::from).collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let active = state
            .active_session_id
            .as_ref()
            .and_then(|id| state.sessions.get(id));

        match active {
            Some(session) => Self {
                active_session_id: Some(session.content_id.clone()),
                title: Some(session.title.clone()),
                url: Some(session.url.clone()),
                page_url: state.active_url,
                indexing_status: state.indexing_status,
                conversation: session.conversation.as_slice().to_vec(),
                banner: Banner::from_state(
                    state.last_error.as_ref(),
                    state.indexing_status,
                    &session.content_id,
                ),
                loading: loading.contains(&session.content_id),
                sessions,
            },
            None => Self {
                title: state.active_title,
                url: state.active_url.clone(),
                page_url: state.active_url,
                indexing_status: state.indexing_status,
                banner: state.last_error.map(|err| Banner::Error {
                    kind: err.kind,
                    message: err.message,
                }),
                sessions,
                ..Self::default()
            },
        }
    }
}

struct Inner {
    store: SessionStore,
    channel: ChannelClient,
    /// Asks still pending per session
    pending: Mutex<HashMap<ContentId, usize>>,
    view: watch::Sender<ViewState>,
    events: Mutex<Option<broadcast::Receiver<StoreEvent>>>,
}

/// Presentation-side façade. Cheap to clone.
#[derive(Clone)]
pub struct Projector {
    inner: Arc<Inner>,
}

impl Projector {
    /// Subscribes to the store immediately so no change between construction
    /// and [`Projector::spawn`] is missed.
    pub fn new(store: SessionStore, channel: ChannelClient) -> Result<Self> {
        let events = store.subscribe();
        let initial = ViewState::project(store.snapshot()?, &HashSet::new());
        let (view, _) = watch::channel(initial);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                channel,
                pending: Mutex::new(HashMap::new()),
                view,
                events: Mutex::new(Some(events)),
            }),
        })
    }

    /// Start following store changes
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.inner.events.lock().ok().and_then(|mut slot| slot.take());
        let this = self.clone();
        tokio::spawn(async move {
            let Some(events) = events else {
                tracing::warn!("Projector already running");
                return;
            };
            this.follow(events, cancel).await;
        })
    }

    /// Watch the projected view
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.inner.view.subscribe()
    }

    /// The view as last projected
    pub fn current(&self) -> ViewState {
        self.inner.view.borrow().clone()
    }

    async fn follow(&self, mut events: broadcast::Receiver<StoreEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.apply(&event),
                // The projection is rebuilt from a snapshot either way
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Projector lagged behind store events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            self.refresh();
        }
    }

    fn apply(&self, event: &StoreEvent) {
        if let StoreEvent::SessionDeleted { content_id } = event {
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.remove(content_id);
            }
        }
    }

    fn begin_ask(&self, content_id: &ContentId) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            *pending.entry(content_id.clone()).or_insert(0) += 1;
        }
    }

    fn finish_ask(&self, content_id: &ContentId) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            if let Some(count) = pending.get_mut(content_id) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(content_id);
                }
            }
        }
    }

    /// Re-project from the store
    pub fn refresh(&self) {
        let loading: HashSet<ContentId> = match self.inner.pending.lock() {
            Ok(pending) => pending.keys().cloned().collect(),
            Err(_) => HashSet::new(),
        };
        match self.inner.store.snapshot() {
            Ok(state) => {
                self.inner
                    .view
                    .send_replace(ViewState::project(state, &loading));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to project state"),
        }
    }

    // ============================================
    // Commands
    // ============================================

    /// Ask about the active session. The session is captured now, so the
    /// answer lands there even if the user switches away meanwhile.
    pub async fn ask(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::EmptyQuestion);
        }
        let content_id = self
            .inner
            .store
            .active_session_id()?
            .ok_or(Error::NoContentDetected)?;

        self.begin_ask(&content_id);
        self.refresh();

        // Either way an answer or an error now exists for this session
        let result = self.inner.channel.ask(text, Some(content_id.clone())).await;
        self.finish_ask(&content_id);
        self.refresh();
        result
    }

    pub fn switch_session(&self, content_id: &ContentId) -> Result<()> {
        self.inner.store.set_active_session(content_id)?;
        self.refresh();
        Ok(())
    }

    /// Empty a session's conversation; the session itself stays
    pub fn clear_conversation(&self, content_id: &ContentId) -> Result<()> {
        self.inner
            .store
            .update(content_id, |session| session.conversation.clear())?;
        self.refresh();
        Ok(())
    }

    /// Remove a session entirely. Confirmation is the caller's job.
    pub fn delete_session(&self, content_id: &ContentId) -> Result<bool> {
        let removed = self.inner.store.delete(content_id)?;
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(content_id);
        }
        self.refresh();
        Ok(removed)
    }

    /// Seek the host player to a citation offset
    pub async fn jump_to_time(&self, seconds: f64) -> Result<()> {
        self.inner.channel.jump_to_time(seconds).await
    }

    /// Re-announce the background context's last known page so it (re)starts
    /// ingestion for it, e.g. when presentation opens.
    pub async fn resync(&self) -> Result<()> {
        let state = self.inner.channel.get_state().await?;
        if let Some(url) = state.url {
            self.inner
                .channel
                .url_changed(&crate::types::PageLocation::new(
                    url,
                    state.title.unwrap_or_default(),
                ))
                .await?;
        }
        Ok(())
    }
}
