//! Session Store
//!
//! Durable mapping from content id to [`SessionRecord`], plus the singleton
//! state the coordinators share (observed location, active session, indexing
//! status, last error, ingest claims).
//!
//! Persistence and notification are separate concerns: every mutation is one
//! atomic read-modify-write in SQLite, and only after it commits is a
//! [`StoreEvent`] published to subscribers. Observers never depend on storage
//! internals to learn about changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::content;
use crate::db::repo::{self, keys};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::*;

const EVENT_CAPACITY: usize = 256;

/// Change notification published after a successful write
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    LocationChanged(PageLocation),
    SessionCreated {
        content_id: ContentId,
    },
    /// Messages appended to the end of a conversation, in order
    MessagesAppended {
        content_id: ContentId,
        messages: Vec<Message>,
    },
    ConversationCleared {
        content_id: ContentId,
    },
    /// Title or url changed without touching the conversation
    SessionUpdated {
        content_id: ContentId,
    },
    SessionDeleted {
        content_id: ContentId,
    },
    ActiveSessionChanged {
        content_id: Option<ContentId>,
    },
    IndexingChanged {
        content_id: ContentId,
        status: IndexingStatus,
    },
    ErrorRaised(LastError),
    ErrorCleared {
        content_id: Option<ContentId>,
    },
}

/// Result of [`SessionStore::migrate_legacy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Legacy conversation moved into a session
    Migrated {
        content_id: ContentId,
        messages: usize,
    },
    /// A session map already exists; nothing was touched
    AlreadyMigrated,
    /// No legacy conversation is stored
    NothingToMigrate,
    /// Legacy data exists but the current page has no content to key it by;
    /// it is left in place for a later attempt
    NoContent,
}

/// Entry of the pre-multi-session conversation layout
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyEntry {
    Current(Message),
    Legacy(LegacyMessage),
}

#[derive(Deserialize)]
struct LegacyMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
    /// Milliseconds since the epoch (user messages only)
    #[serde(default)]
    timestamp: Option<i64>,
    /// Citation offsets (assistant messages only)
    #[serde(default)]
    timestamps: Vec<f64>,
}

impl LegacyEntry {
    fn into_message(self, fallback: DateTime<Utc>) -> Message {
        match self {
            LegacyEntry::Current(message) => message,
            LegacyEntry::Legacy(legacy) => {
                let at = legacy
                    .timestamp
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .unwrap_or(fallback);
                if legacy.kind == "user" {
                    Message::User {
                        text: legacy.content,
                        sent_at: at,
                    }
                } else {
                    Message::Assistant {
                        text: legacy.content,
                        citation_offsets: legacy.timestamps,
                        received_at: at,
                    }
                }
            }
        }
    }
}

/// Shared handle to the persistent state. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    /// Wrap an already-migrated database
    pub fn new(db: Arc<Database>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    /// Fresh in-memory store with the schema applied
    pub fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.migrate()?;
        Ok(Self::new(Arc::new(db)))
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    // ============================================
    // Sessions
    // ============================================

    /// Return the session for `content_id`, creating it from `defaults` if absent.
    pub fn get_or_create(
        &self,
        content_id: &ContentId,
        defaults: SessionDefaults,
    ) -> Result<SessionRecord> {
        let (record, created) = self.db.write(|tx| {
            if let Some(existing) = repo::get_session(tx, content_id)? {
                return Ok((existing, false));
            }
            let now = Utc::now();
            let record = SessionRecord {
                content_id: content_id.clone(),
                title: defaults.title,
                url: defaults.url,
                conversation: Conversation::new(),
                created_at: now,
                updated_at: now,
            };
            repo::put_session(tx, &record)?;
            Ok((record, true))
        })?;

        if created {
            tracing::debug!(content_id = %content_id, "Created session");
            self.publish(vec![StoreEvent::SessionCreated {
                content_id: content_id.clone(),
            }]);
        }
        Ok(record)
    }

    pub fn get(&self, content_id: &ContentId) -> Result<Option<SessionRecord>> {
        self.db.read(|conn| repo::get_session(conn, content_id))
    }

    /// All sessions, most recently active first
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        self.db.read(repo::list_sessions)
    }

    /// Apply `mutator` to the session as currently persisted and store the result.
    ///
    /// The read, the mutation and the write happen under one write lock, so two
    /// writers updating the same session never lose each other's changes.
    pub fn update<F>(&self, content_id: &ContentId, mutator: F) -> Result<SessionRecord>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let (before, after) = self.db.write(|tx| {
            let before = repo::get_session(tx, content_id)?
                .ok_or_else(|| Error::SessionNotFound(content_id.to_string()))?;
            let mut after = before.clone();
            mutator(&mut after);
            // Identity and creation time are not the mutator's to change
            after.content_id = before.content_id.clone();
            after.created_at = before.created_at;
            if after != before {
                after.updated_at = Utc::now();
                repo::put_session(tx, &after)?;
            }
            Ok((before, after))
        })?;

        self.publish(session_diff(&before, &after));
        Ok(after)
    }

    /// Append one message to the end of a session's conversation
    pub fn append(&self, content_id: &ContentId, message: Message) -> Result<SessionRecord> {
        self.update(content_id, |session| session.conversation.push(message))
    }

    /// Remove a session. Clears the active session if it pointed here.
    pub fn delete(&self, content_id: &ContentId) -> Result<bool> {
        let (removed, was_active) = self.db.write(|tx| {
            let removed = repo::delete_session(tx, content_id)?;
            let active: Option<ContentId> = repo::get_value(tx, keys::ACTIVE_SESSION)?;
            let was_active = active.as_ref() == Some(content_id);
            if was_active {
                repo::remove_value(tx, keys::ACTIVE_SESSION)?;
            }
            Ok((removed, was_active))
        })?;

        let mut events = Vec::new();
        if removed {
            tracing::info!(content_id = %content_id, "Deleted session");
            events.push(StoreEvent::SessionDeleted {
                content_id: content_id.clone(),
            });
        }
        if was_active {
            events.push(StoreEvent::ActiveSessionChanged { content_id: None });
        }
        self.publish(events);
        Ok(removed)
    }

    // ============================================
    // Active session and observed location
    // ============================================

    pub fn active_session_id(&self) -> Result<Option<ContentId>> {
        self.db.read(|conn| repo::get_value(conn, keys::ACTIVE_SESSION))
    }

    /// Point the active session at an existing session
    pub fn set_active_session(&self, content_id: &ContentId) -> Result<()> {
        let changed = self.db.write(|tx| {
            if repo::get_session(tx, content_id)?.is_none() {
                return Err(Error::SessionNotFound(content_id.to_string()));
            }
            let current: Option<ContentId> = repo::get_value(tx, keys::ACTIVE_SESSION)?;
            if current.as_ref() == Some(content_id) {
                return Ok(false);
            }
            repo::set_value(tx, keys::ACTIVE_SESSION, content_id)?;
            Ok(true)
        })?;

        if changed {
            self.publish(vec![StoreEvent::ActiveSessionChanged {
                content_id: Some(content_id.clone()),
            }]);
        }
        Ok(())
    }

    pub fn location(&self) -> Result<Option<PageLocation>> {
        self.db.read(|conn| {
            let url: Option<String> = repo::get_value(conn, keys::URL)?;
            let title: Option<String> = repo::get_value(conn, keys::TITLE)?;
            Ok(url.map(|url| PageLocation {
                url,
                title: title.unwrap_or_default(),
            }))
        })
    }

    /// Record the page the host is currently showing
    pub fn set_location(&self, location: &PageLocation) -> Result<()> {
        self.db.write(|tx| {
            repo::set_value(tx, keys::URL, &location.url)?;
            repo::set_value(tx, keys::TITLE, &location.title)
        })?;
        self.publish(vec![StoreEvent::LocationChanged(location.clone())]);
        Ok(())
    }

    // ============================================
    // Indexing status
    // ============================================

    pub fn indexing_status(&self, content_id: &ContentId) -> Result<IndexingStatus> {
        self.db.read(|conn| repo::get_status(conn, content_id))
    }

    /// Move the status forward (see [`IndexingStatus::advance`]); returns the
    /// status actually stored.
    pub fn advance_status(
        &self,
        content_id: &ContentId,
        next: IndexingStatus,
    ) -> Result<IndexingStatus> {
        let (current, stored) = self.db.write(|tx| {
            let current = repo::get_status(tx, content_id)?;
            let stored = current.advance(next);
            if stored != current {
                repo::put_status(tx, content_id, stored)?;
            }
            Ok((current, stored))
        })?;

        if stored != current {
            tracing::debug!(content_id = %content_id, from = %current, to = %stored, "Indexing status changed");
            self.publish(vec![StoreEvent::IndexingChanged {
                content_id: content_id.clone(),
                status: stored,
            }]);
        }
        Ok(stored)
    }

    /// Explicitly put a content back to `NotStarted` (re-ingestion)
    pub fn reset_status(&self, content_id: &ContentId) -> Result<()> {
        self.db
            .write(|tx| repo::put_status(tx, content_id, IndexingStatus::NotStarted))?;
        self.publish(vec![StoreEvent::IndexingChanged {
            content_id: content_id.clone(),
            status: IndexingStatus::NotStarted,
        }]);
        Ok(())
    }

    // ============================================
    // Ingest de-duplication
    // ============================================

    /// Compare-and-set claim on `url`; true means the caller should issue the
    /// ingest request.
    pub fn claim_ingest(&self, url: &str, ttl: Duration) -> Result<bool> {
        self.db
            .write(|tx| repo::claim_url(tx, url, Utc::now(), ttl))
    }

    /// Make `url` eligible for a new ingest request
    pub fn release_ingest(&self, url: &str) -> Result<bool> {
        self.db.write(|tx| repo::release_url(tx, url))
    }

    // ============================================
    // Last error
    // ============================================

    pub fn last_error(&self) -> Result<Option<LastError>> {
        self.db.read(|conn| repo::get_value(conn, keys::LAST_ERROR))
    }

    /// Replace the last error
    pub fn record_error(&self, error: LastError) -> Result<()> {
        self.db
            .write(|tx| repo::set_value(tx, keys::LAST_ERROR, &error))?;
        tracing::warn!(
            content_id = ?error.content_id.as_ref().map(ContentId::as_str),
            kind = ?error.kind,
            message = %error.message,
            "Recorded error"
        );
        self.publish(vec![StoreEvent::ErrorRaised(error)]);
        Ok(())
    }

    /// Clear the last error if it belongs to `content_id`.
    pub fn clear_error_for(&self, content_id: &ContentId) -> Result<bool> {
        let cleared = self.db.write(|tx| {
            let current: Option<LastError> = repo::get_value(tx, keys::LAST_ERROR)?;
            match current {
                Some(err) if err.content_id.as_ref() == Some(content_id) => {
                    repo::remove_value(tx, keys::LAST_ERROR)
                }
                _ => Ok(false),
            }
        })?;

        if cleared {
            self.publish(vec![StoreEvent::ErrorCleared {
                content_id: Some(content_id.clone()),
            }]);
        }
        Ok(cleared)
    }

    /// Clear the last error unconditionally
    pub fn clear_error(&self) -> Result<bool> {
        let cleared = self
            .db
            .write(|tx| repo::remove_value(tx, keys::LAST_ERROR))?;
        if cleared {
            self.publish(vec![StoreEvent::ErrorCleared { content_id: None }]);
        }
        Ok(cleared)
    }

    // ============================================
    // Snapshot and migration
    // ============================================

    /// Read the whole persisted state in one consistent pass
    pub fn snapshot(&self) -> Result<GlobalState> {
        self.db.read(|conn| {
            let active_url: Option<String> = repo::get_value(conn, keys::URL)?;
            let active_title: Option<String> = repo::get_value(conn, keys::TITLE)?;
            let active_session_id: Option<ContentId> =
                repo::get_value(conn, keys::ACTIVE_SESSION)?;
            let last_error: Option<LastError> = repo::get_value(conn, keys::LAST_ERROR)?;

            let status_key = active_session_id
                .clone()
                .or_else(|| active_url.as_deref().and_then(content::content_id_from_url));
            let indexing_status = match status_key {
                Some(id) => repo::get_status(conn, &id)?,
                None => IndexingStatus::NotStarted,
            };

            let sessions = repo::list_sessions(conn)?
                .into_iter()
                .map(|s| (s.content_id.clone(), s))
                .collect();

            Ok(GlobalState {
                active_url,
                active_title,
                indexing_status,
                last_error,
                sessions,
                active_session_id,
            })
        })
    }

    /// Move a pre-multi-session conversation into a session keyed by the
    /// content currently observed at `current`.
    ///
    /// Runs at most once: it only acts when the legacy field exists and no
    /// session has been stored yet, and it removes the legacy field.
    pub fn migrate_legacy(&self, current: &PageLocation) -> Result<MigrationOutcome> {
        let content_id = content::content_id_from_url(&current.url);

        let outcome = self.db.write(|tx| {
            let legacy: Option<Vec<LegacyEntry>> =
                repo::get_value(tx, keys::LEGACY_CONVERSATION)?;
            let Some(legacy) = legacy else {
                return Ok(MigrationOutcome::NothingToMigrate);
            };
            if repo::count_sessions(tx)? > 0 {
                return Ok(MigrationOutcome::AlreadyMigrated);
            }
            let Some(content_id) = content_id.clone() else {
                return Ok(MigrationOutcome::NoContent);
            };

            let now = Utc::now();
            let messages: Vec<Message> = legacy
                .into_iter()
                .map(|entry| entry.into_message(now))
                .collect();
            let count = messages.len();

            let record = SessionRecord {
                content_id: content_id.clone(),
                title: content::normalize_title(&current.title),
                url: current.url.clone(),
                conversation: Conversation::from(messages),
                created_at: now,
                updated_at: now,
            };
            repo::put_session(tx, &record)?;
            repo::remove_value(tx, keys::LEGACY_CONVERSATION)?;

            let active: Option<ContentId> = repo::get_value(tx, keys::ACTIVE_SESSION)?;
            if active.is_none() {
                repo::set_value(tx, keys::ACTIVE_SESSION, &content_id)?;
            }

            Ok(MigrationOutcome::Migrated {
                content_id,
                messages: count,
            })
        })?;

        match &outcome {
            MigrationOutcome::Migrated {
                content_id,
                messages,
            } => {
                tracing::info!(content_id = %content_id, messages, "Migrated legacy conversation");
                self.publish(vec![
                    StoreEvent::SessionCreated {
                        content_id: content_id.clone(),
                    },
                    StoreEvent::ActiveSessionChanged {
                        content_id: Some(content_id.clone()),
                    },
                ]);
            }
            other => tracing::debug!(outcome = ?other, "Legacy migration skipped"),
        }
        Ok(outcome)
    }

    /// Raw access for maintenance tooling and tests
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

/// Events describing how a session changed between two versions
fn session_diff(before: &SessionRecord, after: &SessionRecord) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    let content_id = &after.content_id;
    let old = before.conversation.as_slice();
    let new = after.conversation.as_slice();

    if new.len() >= old.len() && new[..old.len()] == *old {
        if new.len() > old.len() {
            events.push(StoreEvent::MessagesAppended {
                content_id: content_id.clone(),
                messages: new[old.len()..].to_vec(),
            });
        }
    } else {
        events.push(StoreEvent::ConversationCleared {
            content_id: content_id.clone(),
        });
        if !new.is_empty() {
            events.push(StoreEvent::MessagesAppended {
                content_id: content_id.clone(),
                messages: new.to_vec(),
            });
        }
    }

    if before.title != after.title || before.url != after.url {
        events.push(StoreEvent::SessionUpdated {
            content_id: content_id.clone(),
        });
    }
    events
}
