//! Integration tests for the synchronizer
//!
//! These drive the full runtime (observer, background context, projector)
//! against a scripted service and a simulated host page, with the store either
//! in memory or on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use vidqa_core::db::repo::{self, keys};
use vidqa_core::service::{AskRequest, AskResponse, IngestResponse, Reference, StatusResponse};
use vidqa_core::{
    Config, ContentId, Database, Error, IndexingStatus, Message, MigrationOutcome, PageLocation,
    PlayerControl, QaService, SessionStore, SimulatedPage, Synchronizer,
};

const ABC: &str = "https://www.youtube.com/watch?v=ABC123";
const XYZ: &str = "https://www.youtube.com/watch?v=XYZ789";

// ============================================
// Test doubles
// ============================================

/// Service whose status reply the test sets explicitly
struct MockService {
    ingested: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, StatusResponse>>,
    answers: Mutex<HashMap<String, (Duration, String, Vec<f64>)>>,
}

impl MockService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ingested: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            answers: Mutex::new(HashMap::new()),
        })
    }

    fn set_status(&self, id: &str, indexed: bool, status: &str, chunk_count: u32) {
        self.statuses.lock().unwrap().insert(
            id.to_string(),
            StatusResponse {
                indexed,
                status: Some(status.to_string()),
                chunk_count,
            },
        );
    }

    fn answer(&self, question: &str, delay_ms: u64, answer: &str, starts: &[f64]) {
        self.answers.lock().unwrap().insert(
            question.to_string(),
            (Duration::from_millis(delay_ms), answer.to_string(), starts.to_vec()),
        );
    }

    fn ingest_count(&self, url: &str) -> usize {
        self.ingested
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

#[async_trait]
impl QaService for MockService {
    async fn ingest(&self, url: &str) -> vidqa_core::Result<IngestResponse> {
        self.ingested.lock().unwrap().push(url.to_string());
        Ok(IngestResponse::default())
    }

    async fn status(&self, content_id: &ContentId) -> vidqa_core::Result<StatusResponse> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(content_id.as_str())
            .cloned()
            .unwrap_or(StatusResponse {
                indexed: false,
                status: Some("indexing".to_string()),
                chunk_count: 0,
            }))
    }

    async fn ask(&self, request: &AskRequest) -> vidqa_core::Result<AskResponse> {
        let scripted = self.answers.lock().unwrap().get(&request.question).cloned();
        let (delay, answer, starts) = scripted.ok_or_else(|| {
            Error::Network(format!("API error (500): no answer for {}", request.question))
        })?;
        tokio::time::sleep(delay).await;
        Ok(AskResponse {
            answer,
            references: Some(starts.into_iter().map(|start| Reference { start }).collect()),
        })
    }
}

#[derive(Default)]
struct RecordingPlayer {
    seeks: Mutex<Vec<f64>>,
}

impl PlayerControl for RecordingPlayer {
    fn seek(&self, seconds: f64) -> vidqa_core::Result<()> {
        self.seeks.lock().unwrap().push(seconds);
        Ok(())
    }
}

// ============================================
// Helpers
// ============================================

fn fast_config() -> Config {
    let mut config = Config::default();
    config.polling.location_interval_ms = 10;
    config.polling.status_interval_ms = 10;
    config
}

fn on_disk_store(dir: &TempDir) -> SessionStore {
    let path: PathBuf = dir.path().join("state.db");
    let db = Database::open(&path).expect("open database");
    db.migrate().expect("migrate");
    SessionStore::new(Arc::new(db))
}

fn start(
    store: SessionStore,
    service: Arc<MockService>,
    page: Arc<SimulatedPage>,
    player: Arc<RecordingPlayer>,
) -> Synchronizer {
    vidqa_core::logging::init_test();
    Synchronizer::start(&fast_config(), store, service, page, player).expect("start synchronizer")
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn status_of(store: &SessionStore, id: &str) -> IndexingStatus {
    store.indexing_status(&ContentId::from(id)).unwrap()
}

fn conversation(store: &SessionStore, id: &str) -> Vec<String> {
    store
        .get(&ContentId::from(id))
        .unwrap()
        .map(|s| s.conversation.iter().map(|m| m.text().to_string()).collect())
        .unwrap_or_default()
}

// ============================================
// Ingestion
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingest_once_per_distinct_url() {
    let service = MockService::new();
    let page = SimulatedPage::new();
    let sync = start(
        SessionStore::in_memory().unwrap(),
        service.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    let store = sync.store().clone();

    page.navigate(PageLocation::new(ABC, "First - YouTube"));
    page.navigate(PageLocation::new(ABC, "First - YouTube"));
    page.navigate_then_retitle(PageLocation::new(ABC, "(1) First - YouTube"));
    eventually("first ingest", || service.ingest_count(ABC) == 1).await;

    page.navigate_silently(PageLocation::new(XYZ, "Second - YouTube"));
    eventually("second ingest", || service.ingest_count(XYZ) == 1).await;

    // Back to an already requested url
    page.navigate(PageLocation::new(ABC, "First - YouTube"));
    eventually("active session back on ABC", || {
        store.active_session_id().unwrap() == Some(ContentId::from("ABC123"))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.ingest_count(ABC), 1);
    assert_eq!(service.ingest_count(XYZ), 1);
    assert_eq!(store.list().unwrap().len(), 2);
    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_does_not_repeat_ingest_but_resumes_polling() {
    let dir = TempDir::new().unwrap();
    let page = SimulatedPage::new();
    page.navigate_silently(PageLocation::new(ABC, "Talk"));

    let first = MockService::new();
    first.set_status("ABC123", false, "indexing", 3);
    let sync = start(
        on_disk_store(&dir),
        first.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    eventually("first ingest", || first.ingest_count(ABC) == 1).await;
    eventually("indexing progress", || {
        status_of(sync.store(), "ABC123") == IndexingStatus::Indexing { chunk_count: 3 }
    })
    .await;
    sync.shutdown().await;

    let second = MockService::new();
    second.set_status("ABC123", true, "indexed", 9);
    let sync = start(
        on_disk_store(&dir),
        second.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    eventually("indexed after restart", || {
        status_of(sync.store(), "ABC123") == IndexingStatus::Indexed
    })
    .await;
    assert_eq!(second.ingest_count(ABC), 0);
    sync.shutdown().await;
}

// ============================================
// Questions
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ask_before_and_after_indexing() {
    let service = MockService::new();
    service.set_status("ABC123", false, "indexing", 12);
    service.answer("summary", 0, "It covers ownership.", &[61.0, 12.0]);
    let page = SimulatedPage::new();
    let sync = start(
        SessionStore::in_memory().unwrap(),
        service.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    let store = sync.store().clone();

    page.navigate(PageLocation::new(ABC, "Rust talk - YouTube"));
    eventually("first poll", || {
        status_of(&store, "ABC123") == IndexingStatus::Indexing { chunk_count: 12 }
    })
    .await;

    let err = sync.projector().ask("summary").await.unwrap_err();
    match err {
        Error::NotIndexedYet { status } => assert_eq!(status.chunk_count(), Some(12)),
        other => panic!("expected NotIndexedYet, got {:?}", other),
    }
    assert!(conversation(&store, "ABC123").is_empty());

    service.set_status("ABC123", true, "indexed", 40);
    eventually("indexed", || status_of(&store, "ABC123") == IndexingStatus::Indexed).await;

    sync.projector().ask("summary").await.unwrap();
    let session = store.get(&ContentId::from("ABC123")).unwrap().unwrap();
    assert_eq!(session.conversation.len(), 2);
    match &session.conversation.as_slice()[1] {
        Message::Assistant {
            citation_offsets, ..
        } => assert_eq!(citation_offsets, &vec![61.0, 12.0]),
        other => panic!("expected assistant, got {:?}", other),
    }

    let mut view = sync.projector().subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        view.wait_for(|v| v.conversation.len() == 2 && !v.loading && v.banner.is_none()),
    )
    .await
    .unwrap()
    .unwrap();
    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_answers_keep_question_order() {
    let service = MockService::new();
    service.set_status("ABC123", true, "indexed", 5);
    service.answer("q1", 150, "a1", &[]);
    service.answer("q2", 0, "a2", &[]);
    let page = SimulatedPage::new();
    let sync = start(
        SessionStore::in_memory().unwrap(),
        service.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    let store = sync.store().clone();

    page.navigate(PageLocation::new(ABC, "t"));
    eventually("indexed", || status_of(&store, "ABC123") == IndexingStatus::Indexed).await;

    let projector = sync.projector().clone();
    let first = tokio::spawn({
        let projector = projector.clone();
        async move { projector.ask("q1").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn(async move { projector.ask("q2").await });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(conversation(&store, "ABC123"), vec!["q1", "a1", "q2", "a2"]);
    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_answer_follows_asking_session_across_switch() {
    let service = MockService::new();
    service.set_status("ABC123", true, "indexed", 5);
    service.set_status("XYZ789", true, "indexed", 5);
    service.answer("slow question", 150, "late answer", &[]);
    let page = SimulatedPage::new();
    let sync = start(
        SessionStore::in_memory().unwrap(),
        service.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    let store = sync.store().clone();

    page.navigate(PageLocation::new(XYZ, "other"));
    eventually("XYZ indexed", || status_of(&store, "XYZ789") == IndexingStatus::Indexed).await;
    page.navigate(PageLocation::new(ABC, "t"));
    eventually("ABC indexed", || status_of(&store, "ABC123") == IndexingStatus::Indexed).await;

    let projector = sync.projector().clone();
    let in_flight = tokio::spawn({
        let projector = projector.clone();
        async move { projector.ask("slow question").await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    projector.switch_session(&ContentId::from("XYZ789")).unwrap();

    in_flight.await.unwrap().unwrap();
    assert_eq!(
        conversation(&store, "ABC123"),
        vec!["slow question", "late answer"]
    );
    assert!(conversation(&store, "XYZ789").is_empty());
    assert_eq!(
        store.active_session_id().unwrap(),
        Some(ContentId::from("XYZ789"))
    );
    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_answer_banner_clears_after_next_answer() {
    let service = MockService::new();
    service.set_status("ABC123", true, "indexed", 5);
    let page = SimulatedPage::new();
    let sync = start(
        SessionStore::in_memory().unwrap(),
        service.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    let store = sync.store().clone();

    page.navigate(PageLocation::new(ABC, "t"));
    eventually("indexed", || status_of(&store, "ABC123") == IndexingStatus::Indexed).await;

    let err = sync.projector().ask("unanswerable").await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));
    assert_eq!(conversation(&store, "ABC123"), vec!["unanswerable"]);

    let view = sync.projector().current();
    assert!(!view.loading);
    assert_eq!(
        view.banner.map(|b| b.message()),
        Some("Failed to get answer".to_string())
    );

    // A later answer on the same session takes the failure banner down
    service.answer("retry", 0, "now it works", &[]);
    sync.projector().ask("retry").await.unwrap();
    assert!(store.last_error().unwrap().is_none());
    let view = sync.projector().current();
    assert_eq!(view.banner, None);
    assert_eq!(
        conversation(&store, "ABC123"),
        vec!["unanswerable", "retry", "now it works"]
    );
    sync.shutdown().await;
}

// ============================================
// Migration and player
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_legacy_conversation_migrates_at_startup() {
    let dir = TempDir::new().unwrap();
    let store = on_disk_store(&dir);
    let legacy = serde_json::json!([
        {"type": "user", "content": "m1", "timestamp": 1_700_000_000_000i64},
        {"type": "assistant", "content": "m2", "timestamps": [3]}
    ]);
    store
        .database()
        .write(|tx| repo::set_value(tx, keys::LEGACY_CONVERSATION, &legacy))
        .unwrap();

    let service = MockService::new();
    let page = SimulatedPage::new();
    page.navigate_silently(PageLocation::new(XYZ, "Old video"));
    let sync = start(
        store,
        service.clone(),
        page.clone(),
        Arc::new(RecordingPlayer::default()),
    );
    assert_eq!(
        sync.migration(),
        &MigrationOutcome::Migrated {
            content_id: ContentId::from("XYZ789"),
            messages: 2,
        }
    );
    assert_eq!(conversation(sync.store(), "XYZ789"), vec!["m1", "m2"]);
    sync.shutdown().await;

    let sync = start(
        on_disk_store(&dir),
        service,
        page,
        Arc::new(RecordingPlayer::default()),
    );
    assert_eq!(sync.migration(), &MigrationOutcome::NothingToMigrate);
    assert_eq!(conversation(sync.store(), "XYZ789"), vec!["m1", "m2"]);
    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jump_to_time_reaches_player() {
    let player = Arc::new(RecordingPlayer::default());
    let sync = start(
        SessionStore::in_memory().unwrap(),
        MockService::new(),
        SimulatedPage::new(),
        player.clone(),
    );

    sync.projector().jump_to_time(125.0).await.unwrap();
    eventually("seek", || player.seeks.lock().unwrap().len() == 1).await;
    assert_eq!(*player.seeks.lock().unwrap(), vec![125.0]);
    sync.shutdown().await;
}
