//! Query Coordinator
//!
//! `ask(content_id, question)` checks that the content is indexed, then hands
//! the question to a per-session worker. The worker appends the `User`
//! message, calls the answering service with the content id captured when the
//! question was asked, and appends the `Assistant` message. One question per
//! session is in flight at a time, so answers land in the order their
//! questions were asked no matter how the network orders the replies.
//!
//! Asks are not cancellable once queued. Dropping the caller's future only
//! discards the reply; the exchange still completes against its own session.
//! A worker retires as soon as its queue is empty; the next question starts a
//! fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::service::{AskRequest, QaService};
use crate::store::SessionStore;
use crate::types::{ContentId, IndexingStatus, LastError, Message, SessionDefaults};

const ANSWER_FAILED: &str = "Failed to get answer";

struct AskJob {
    question: String,
    reply: oneshot::Sender<Result<Message>>,
}

struct Inner {
    store: SessionStore,
    service: Arc<dyn QaService>,
    workers: Mutex<HashMap<ContentId, mpsc::UnboundedSender<AskJob>>>,
}

/// Serializes question/answer exchanges per session. Cheap to clone.
#[derive(Clone)]
pub struct QueryCoordinator {
    inner: Arc<Inner>,
}

impl QueryCoordinator {
    pub fn new(store: SessionStore, service: Arc<dyn QaService>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                service,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ask `question` about `content_id` and wait for the appended answer.
    ///
    /// Fails with [`Error::NotIndexedYet`] (and appends nothing) unless the
    /// content is indexed. A service failure is recorded as the last error
    /// and returned; the user message stays in the conversation.
    pub async fn ask(&self, content_id: &ContentId, question: &str) -> Result<Message> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::EmptyQuestion);
        }

        let status = self.inner.store.indexing_status(content_id)?;
        if status != IndexingStatus::Indexed {
            return Err(Error::NotIndexedYet { status });
        }
        self.inner
            .store
            .get_or_create(content_id, SessionDefaults::for_content(content_id))?;

        let (reply, answer) = oneshot::channel();
        self.enqueue(
            content_id,
            AskJob {
                question: question.to_string(),
                reply,
            },
        )?;

        answer
            .await
            .map_err(|_| Error::MessageChannel("ask worker stopped before replying".to_string()))?
    }

    /// Number of sessions with a live worker
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Stop accepting questions. Queued and in-flight exchanges still finish.
    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.inner.workers.lock() {
            workers.clear();
        }
    }

    fn enqueue(&self, content_id: &ContentId, job: AskJob) -> Result<()> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| Error::MessageChannel("ask queue poisoned".to_string()))?;

        let job = match workers.get(content_id) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return Ok(()),
                // Worker is gone; start a fresh one below
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (queue, jobs) = mpsc::unbounded_channel();
        queue
            .send(job)
            .map_err(|_| Error::MessageChannel("ask queue closed".to_string()))?;
        workers.insert(content_id.clone(), queue.clone());
        drop(workers);

        let worker = SessionWorker {
            inner: self.inner.clone(),
            content_id: content_id.clone(),
            queue,
        };
        tokio::spawn(worker.run(jobs));
        Ok(())
    }
}

/// Runs one session's exchanges in order
struct SessionWorker {
    inner: Arc<Inner>,
    content_id: ContentId,
    /// Identifies this worker's entry in the worker map
    queue: mpsc::UnboundedSender<AskJob>,
}

impl SessionWorker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<AskJob>) {
        tracing::debug!(content_id = %self.content_id, "Ask worker started");
        while let Some(job) = jobs.recv().await {
            let result = self.exchange(&job.question).await;
            // The caller may have stopped waiting
            let _ = job.reply.send(result);
            if self.retire_if_idle(&jobs) {
                break;
            }
        }
        tracing::debug!(content_id = %self.content_id, "Ask worker stopped");
    }

    /// Leave the worker map when nothing is queued.
    ///
    /// Jobs are only sent while the map lock is held, so an empty queue seen
    /// under the lock stays empty once the entry is gone.
    fn retire_if_idle(&self, jobs: &mpsc::UnboundedReceiver<AskJob>) -> bool {
        let Ok(mut workers) = self.inner.workers.lock() else {
            return false;
        };
        if !jobs.is_empty() {
            return false;
        }
        if workers
            .get(&self.content_id)
            .is_some_and(|queue| queue.same_channel(&self.queue))
        {
            workers.remove(&self.content_id);
        }
        true
    }

    async fn exchange(&self, question: &str) -> Result<Message> {
        let store = &self.inner.store;
        store.append(&self.content_id, Message::user(question))?;

        let request = AskRequest::for_content(&self.content_id, question);
        match self.inner.service.ask(&request).await {
            Ok(response) => {
                let answer = Message::assistant(response.answer.clone(), response.citation_offsets());
                store.append(&self.content_id, answer.clone())?;
                // An earlier failure on this session no longer applies
                store.clear_error_for(&self.content_id)?;
                tracing::info!(content_id = %self.content_id, "Answer received");
                Ok(answer)
            }
            Err(e) => {
                tracing::warn!(content_id = %self.content_id, error = %e, "Ask failed");
                store.record_error(LastError::new(
                    Some(self.content_id.clone()),
                    e.kind(),
                    ANSWER_FAILED,
                ))?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::service::testing::ScriptedService;
    use std::time::Duration;

    fn indexed_store(id: &ContentId) -> SessionStore {
        let store = SessionStore::in_memory().unwrap();
        store.advance_status(id, IndexingStatus::Indexed).unwrap();
        store
    }

    fn texts(store: &SessionStore, id: &ContentId) -> Vec<String> {
        store
            .get(id)
            .unwrap()
            .unwrap()
            .conversation
            .iter()
            .map(|m| m.text().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_not_indexed_appends_nothing() {
        let store = SessionStore::in_memory().unwrap();
        let id = ContentId::from("ABC123");
        store
            .advance_status(&id, IndexingStatus::Indexing { chunk_count: 12 })
            .unwrap();
        let service = Arc::new(ScriptedService::default());
        let queries = QueryCoordinator::new(store.clone(), service.clone());

        let err = queries.ask(&id, "summary").await.unwrap_err();
        match err {
            Error::NotIndexedYet { status } => assert_eq!(status.chunk_count(), Some(12)),
            other => panic!("expected NotIndexedYet, got {:?}", other),
        }
        assert!(store.get(&id).unwrap().is_none());
        assert!(service.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ask_appends_user_then_assistant() {
        let id = ContentId::from("ABC123");
        let store = indexed_store(&id);
        let service = Arc::new(ScriptedService::default());
        service.answer("summary", Duration::ZERO, "It is a talk.", &[61.0, 12.0, 30.5]);
        let queries = QueryCoordinator::new(store.clone(), service.clone());

        let answer = queries.ask(&id, "  summary ").await.unwrap();
        assert_eq!(answer.text(), "It is a talk.");

        let session = store.get(&id).unwrap().unwrap();
        let messages = session.conversation.as_slice();
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], Message::User { text, .. } if text == "summary"));
        match &messages[1] {
            Message::Assistant {
                citation_offsets, ..
            } => assert_eq!(citation_offsets, &vec![61.0, 12.0, 30.5]),
            other => panic!("expected assistant, got {:?}", other),
        }

        let sent = service.asked.lock().unwrap();
        assert_eq!(sent[0].video_id, "ABC123");
        assert_eq!(sent[0].session_id, "ABC123");
    }

    #[tokio::test]
    async fn test_out_of_order_replies_stay_in_question_order() {
        let id = ContentId::from("ABC123");
        let store = indexed_store(&id);
        let service = Arc::new(ScriptedService::default());
        service.answer("q1", Duration::from_millis(80), "a1", &[]);
        service.answer("q2", Duration::ZERO, "a2", &[]);
        let queries = QueryCoordinator::new(store.clone(), service);

        let (first, second) = tokio::join!(queries.ask(&id, "q1"), queries.ask(&id, "q2"));
        first.unwrap();
        second.unwrap();

        assert_eq!(texts(&store, &id), vec!["q1", "a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_question_and_records_error() {
        let id = ContentId::from("ABC123");
        let store = indexed_store(&id);
        let service = Arc::new(ScriptedService::default());
        service.fail_question("why");
        let queries = QueryCoordinator::new(store.clone(), service);

        let err = queries.ask(&id, "why").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(texts(&store, &id), vec!["why"]);

        let last = store.last_error().unwrap().unwrap();
        assert_eq!(last.content_id, Some(id));
        assert_eq!(last.message, ANSWER_FAILED);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let id = ContentId::from("ABC123");
        let store = indexed_store(&id);
        let queries = QueryCoordinator::new(store.clone(), Arc::new(ScriptedService::default()));

        assert!(matches!(
            queries.ask(&id, "   ").await,
            Err(Error::EmptyQuestion)
        ));
        assert!(store.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_answer_routes_to_asking_session() {
        let a = ContentId::from("AAA");
        let b = ContentId::from("BBB");
        let store = indexed_store(&a);
        store.advance_status(&b, IndexingStatus::Indexed).unwrap();
        store.get_or_create(&b, SessionDefaults::for_content(&b)).unwrap();
        let service = Arc::new(ScriptedService::default());
        service.answer("slow", Duration::from_millis(50), "late", &[]);
        let queries = QueryCoordinator::new(store.clone(), service);

        let pending = {
            let queries = queries.clone();
            let a = a.clone();
            tokio::spawn(async move { queries.ask(&a, "slow").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_active_session(&b).unwrap();
        pending.await.unwrap().unwrap();

        assert_eq!(texts(&store, &a), vec!["slow", "late"]);
        assert!(texts(&store, &b).is_empty());
    }

    #[tokio::test]
    async fn test_successful_answer_clears_earlier_failure() {
        let id = ContentId::from("ABC123");
        let store = indexed_store(&id);
        let service = Arc::new(ScriptedService::default());
        service.fail_question("q1");
        service.answer("q2", Duration::ZERO, "a2", &[]);
        let queries = QueryCoordinator::new(store.clone(), service);

        queries.ask(&id, "q1").await.unwrap_err();
        assert!(store.last_error().unwrap().is_some());

        queries.ask(&id, "q2").await.unwrap();
        assert!(store.last_error().unwrap().is_none());
        assert_eq!(texts(&store, &id), vec!["q1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_idle_worker_retires_and_restarts() {
        let id = ContentId::from("ABC123");
        let store = indexed_store(&id);
        let queries = QueryCoordinator::new(store.clone(), Arc::new(ScriptedService::default()));

        queries.ask(&id, "first").await.unwrap();
        assert_eq!(queries.worker_count(), 0);

        queries.ask(&id, "second").await.unwrap();
        assert_eq!(queries.worker_count(), 0);
        assert_eq!(
            texts(&store, &id),
            vec!["first", "answer to first", "second", "answer to second"]
        );
    }
}
