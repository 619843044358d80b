//! Message channel between the presentation and background contexts
//!
//! The two contexts share nothing but the store and this channel. Requests
//! are typed values that serialize to the wire shape the host expects
//! (`{"type": "ASK", "query": ...}`); a request either expects one
//! [`Response`] or is fire-and-forget.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ErrorKind, Result};
use crate::types::{ContentId, IndexingStatus, PageLocation};

/// Requests accepted by the background context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Last observed location and its indexing status
    GetState,
    /// The viewed page changed (fire-and-forget)
    UrlChanged {
        url: String,
        #[serde(default)]
        title: String,
    },
    /// Ask a question. `session_id` pins the content the question is about;
    /// without it the observed page decides.
    Ask {
        query: String,
        #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<ContentId>,
    },
    /// Location as reported by the host right now
    GetCurrentTabUrl,
    /// Seek the host player (fire-and-forget)
    JumpToTime { seconds: f64 },
}

/// `{url, title, status}` reply to `GET_STATE` / `GET_CURRENT_TAB_URL`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateReply {
    pub url: Option<String>,
    pub title: Option<String>,
    pub status: IndexingStatus,
}

/// Error carried back across the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
    /// Progress, when the question came too early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<IndexingStatus>,
}

impl From<&Error> for ReplyError {
    fn from(err: &Error) -> Self {
        let status = match err {
            Error::NotIndexedYet { status } => Some(*status),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            status,
        }
    }
}

impl ReplyError {
    /// Rebuild a library error on the receiving side
    pub fn into_error(self) -> Error {
        match self.kind {
            ErrorKind::NoContentDetected => Error::NoContentDetected,
            ErrorKind::NotIndexedYet => Error::NotIndexedYet {
                status: self.status.unwrap_or_default(),
            },
            ErrorKind::IndexingFailed => Error::IndexingFailed,
            ErrorKind::NetworkError => Error::Network(self.message),
            ErrorKind::StoreUnavailable => Error::StoreUnavailable(self.message),
            ErrorKind::MessageChannelError => Error::MessageChannel(self.message),
            ErrorKind::SessionNotFound => Error::SessionNotFound(self.message),
            ErrorKind::InvalidInput => Error::EmptyQuestion,
            ErrorKind::Config => Error::Config(self.message),
        }
    }
}

/// `{error?}` reply to `ASK`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AskReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    State(StateReply),
    Ask(AskReply),
}

/// One request in flight, with its reply slot if a reply is expected
pub struct Envelope {
    pub request: Request,
    pub reply: Option<oneshot::Sender<Response>>,
}

/// Create a connected client/receiver pair
pub fn channel(buffer: usize) -> (ChannelClient, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(buffer);
    (ChannelClient { tx }, rx)
}

/// Sending half used by the presentation context and the page observer
#[derive(Clone)]
pub struct ChannelClient {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelClient {
    /// Send a request and wait for its reply
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| Error::MessageChannel("background context is not running".to_string()))?;

        response
            .await
            .map_err(|_| Error::MessageChannel("background context dropped the request".to_string()))
    }

    /// Send a fire-and-forget request
    pub async fn notify(&self, request: Request) -> Result<()> {
        self.tx
            .send(Envelope {
                request,
                reply: None,
            })
            .await
            .map_err(|_| Error::MessageChannel("background context is not running".to_string()))
    }

    pub async fn get_state(&self) -> Result<StateReply> {
        expect_state(self.request(Request::GetState).await?)
    }

    pub async fn current_tab(&self) -> Result<StateReply> {
        expect_state(self.request(Request::GetCurrentTabUrl).await?)
    }

    pub async fn url_changed(&self, location: &PageLocation) -> Result<()> {
        self.notify(Request::UrlChanged {
            url: location.url.clone(),
            title: location.title.clone(),
        })
        .await
    }

    /// Ask about `session_id` (or the observed page); `Err` carries the
    /// per-call failure.
    pub async fn ask(&self, query: &str, session_id: Option<ContentId>) -> Result<()> {
        let response = self
            .request(Request::Ask {
                query: query.to_string(),
                session_id,
            })
            .await?;
        match response {
            Response::Ask(AskReply { error: None }) => Ok(()),
            Response::Ask(AskReply { error: Some(err) }) => Err(err.into_error()),
            Response::State(_) => Err(unexpected("ASK")),
        }
    }

    pub async fn jump_to_time(&self, seconds: f64) -> Result<()> {
        self.notify(Request::JumpToTime { seconds }).await
    }
}

fn expect_state(response: Response) -> Result<StateReply> {
    match response {
        Response::State(state) => Ok(state),
        Response::Ask(_) => Err(unexpected("state request")),
    }
}

fn unexpected(what: &str) -> Error {
    Error::MessageChannel(format!("unexpected reply to {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let ask = Request::Ask {
            query: "summary".to_string(),
            session_id: None,
        };
        assert_eq!(
            serde_json::to_value(&ask).unwrap(),
            serde_json::json!({"type": "ASK", "query": "summary"})
        );

        let parsed: Request = serde_json::from_str(
            r#"{"type": "URL_CHANGED", "url": "https://www.youtube.com/watch?v=ABC123"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Request::UrlChanged {
                url: "https://www.youtube.com/watch?v=ABC123".to_string(),
                title: String::new(),
            }
        );

        let parsed: Request =
            serde_json::from_str(r#"{"type": "GET_CURRENT_TAB_URL"}"#).unwrap();
        assert_eq!(parsed, Request::GetCurrentTabUrl);

        let parsed: Request =
            serde_json::from_str(r#"{"type": "JUMP_TO_TIME", "seconds": 61.5}"#).unwrap();
        assert_eq!(parsed, Request::JumpToTime { seconds: 61.5 });
    }

    #[test]
    fn test_not_indexed_reply_round_trips_progress() {
        let err = Error::NotIndexedYet {
            status: IndexingStatus::Indexing { chunk_count: 12 },
        };
        let reply = ReplyError::from(&err);
        match reply.into_error() {
            Error::NotIndexedYet { status } => assert_eq!(status.chunk_count(), Some(12)),
            other => panic!("expected NotIndexedYet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_message_channel_error() {
        let (client, rx) = channel(4);
        drop(rx);

        let err = client.get_state().await.unwrap_err();
        assert!(matches!(err, Error::MessageChannel(_)));
        let err = client.jump_to_time(3.0).await.unwrap_err();
        assert!(matches!(err, Error::MessageChannel(_)));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_message_channel_error() {
        let (client, mut rx) = channel(4);
        tokio::spawn(async move {
            // Receive and drop without replying
            let _ = rx.recv().await;
        });

        let err = client.get_state().await.unwrap_err();
        assert!(matches!(err, Error::MessageChannel(_)));
    }
}
