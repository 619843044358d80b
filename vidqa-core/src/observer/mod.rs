//! Location Observer
//!
//! Produces a de-duplicated stream of `{url, title}` whenever the viewed page
//! changes. Three signals feed it, because each alone can miss transitions:
//!
//! - intercepted programmatic navigation (misses externally-triggered moves)
//! - title mutations (can lag behind the url)
//! - a periodic poll of the current location (bounds worst-case latency to
//!   one interval)
//!
//! Consecutive events never repeat the same url. The observer only emits; it
//! never writes shared state.

mod page;

pub use page::{HostPage, SimulatedPage};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::types::PageLocation;

const EVENT_BUFFER: usize = 32;

/// Suppresses consecutive events for the same url
#[derive(Debug, Default)]
pub struct UrlDeduplicator {
    last_url: Option<String>,
}

impl UrlDeduplicator {
    /// True if `location` should be emitted
    pub fn accept(&mut self, location: &PageLocation) -> bool {
        if self.last_url.as_deref() == Some(location.url.as_str()) {
            return false;
        }
        self.last_url = Some(location.url.clone());
        true
    }
}

/// Receive from a signal, parking forever once the sender is gone
async fn next_signal<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(value) => Some(value),
        // Missed signals are covered by reading the current location
        Err(broadcast::error::RecvError::Lagged(_)) => None,
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            None
        }
    }
}

/// Watches a [`HostPage`] and emits location changes
pub struct LocationObserver {
    host: Arc<dyn HostPage>,
    poll_interval: Duration,
}

impl LocationObserver {
    pub fn new(host: Arc<dyn HostPage>, poll_interval: Duration) -> Self {
        Self {
            host,
            poll_interval,
        }
    }

    /// Start observing until `cancel` fires or the receiver is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<PageLocation>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<PageLocation>, cancel: CancellationToken) {
        let mut navigations = Some(self.host.subscribe_navigation());
        let mut titles = Some(self.host.subscribe_title_changes());
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dedup = UrlDeduplicator::default();

        tracing::debug!(interval_ms = self.poll_interval.as_millis() as u64, "Location observer started");

        loop {
            let candidate = tokio::select! {
                _ = cancel.cancelled() => break,
                nav = next_signal(&mut navigations) => {
                    nav.or_else(|| self.host.current_location())
                }
                title = next_signal(&mut titles) => {
                    // A title mutation only says something changed; the url
                    // comes from the host
                    self.host.current_location().map(|mut loc| {
                        if let Some(title) = title {
                            if loc.title.is_empty() {
                                loc.title = title;
                            }
                        }
                        loc
                    })
                }
                _ = ticker.tick() => self.host.current_location(),
            };

            let Some(location) = candidate else {
                continue;
            };
            if !dedup.accept(&location) {
                continue;
            }

            tracing::debug!(url = %location.url, "Location changed");
            if tx.send(location).await.is_err() {
                break;
            }
        }

        tracing::debug!("Location observer stopped");
    }
}
