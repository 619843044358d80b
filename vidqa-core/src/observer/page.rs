//! Host page capability
//!
//! The host (browser tab, embedding application, test harness) exposes what
//! it is showing through [`HostPage`]. Navigation interception is a
//! subscription, not a patched global: the host implements it once against
//! whatever navigation primitive it has.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::types::PageLocation;

const SIGNAL_CAPACITY: usize = 64;

/// What the Location Observer needs from the host
pub trait HostPage: Send + Sync {
    /// The page currently shown, if the host can tell
    fn current_location(&self) -> Option<PageLocation>;

    /// Programmatic (in-page) navigations, as they are intercepted
    fn subscribe_navigation(&self) -> broadcast::Receiver<PageLocation>;

    /// Document title mutations
    fn subscribe_title_changes(&self) -> broadcast::Receiver<String>;
}

/// In-process host page driven by explicit calls.
///
/// Used by the CLI driver and by tests to reproduce every navigation path:
/// intercepted navigations, title-only mutations, and silent external
/// navigations only the periodic poll can see.
pub struct SimulatedPage {
    location: Mutex<Option<PageLocation>>,
    navigations: broadcast::Sender<PageLocation>,
    titles: broadcast::Sender<String>,
}

impl SimulatedPage {
    pub fn new() -> Arc<Self> {
        let (navigations, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (titles, _) = broadcast::channel(SIGNAL_CAPACITY);
        Arc::new(Self {
            location: Mutex::new(None),
            navigations,
            titles,
        })
    }

    fn store(&self, location: Option<PageLocation>) {
        if let Ok(mut current) = self.location.lock() {
            *current = location;
        }
    }

    /// In-page navigation seen by the interception hook
    pub fn navigate(&self, location: PageLocation) {
        self.store(Some(location.clone()));
        let _ = self.navigations.send(location);
    }

    /// Navigation the interception hook misses; title mutation fires later
    pub fn navigate_then_retitle(&self, location: PageLocation) {
        self.store(Some(location.clone()));
        let _ = self.titles.send(location.title);
    }

    /// Navigation neither hook sees (only the poll notices)
    pub fn navigate_silently(&self, location: PageLocation) {
        self.store(Some(location));
    }

    /// Leave any page (e.g. tab closed)
    pub fn clear(&self) {
        self.store(None);
    }
}

impl HostPage for SimulatedPage {
    fn current_location(&self) -> Option<PageLocation> {
        self.location.lock().ok().and_then(|loc| loc.clone())
    }

    fn subscribe_navigation(&self) -> broadcast::Receiver<PageLocation> {
        self.navigations.subscribe()
    }

    fn subscribe_title_changes(&self) -> broadcast::Receiver<String> {
        self.titles.subscribe()
    }
}
