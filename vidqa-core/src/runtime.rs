//! Wiring of the two contexts
//!
//! ```text
//!  HostPage ──► LocationObserver ──URL_CHANGED──┐
//!                                               ▼
//!  Projector ◄── store events      Background (IngestCoordinator,
//!      │                            QueryCoordinator, PlayerControl)
//!      └──────ASK / JUMP_TO_TIME / GET_STATE───┘
//! ```
//!
//! Everything is torn down through one cancellation token; in-flight asks are
//! left to finish.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::background::{Background, PlayerControl};
use crate::channel::{self, ChannelClient};
use crate::config::Config;
use crate::error::Result;
use crate::ingest::IngestCoordinator;
use crate::observer::{HostPage, LocationObserver};
use crate::projector::Projector;
use crate::query::QueryCoordinator;
use crate::service::QaService;
use crate::store::{MigrationOutcome, SessionStore};

const CHANNEL_BUFFER: usize = 64;

/// A running synchronizer
pub struct Synchronizer {
    store: SessionStore,
    ingest: IngestCoordinator,
    queries: QueryCoordinator,
    projector: Projector,
    channel: ChannelClient,
    migration: MigrationOutcome,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Synchronizer {
    /// Migrate legacy state, then start the background context, the location
    /// observer and the projector.
    pub fn start(
        config: &Config,
        store: SessionStore,
        service: Arc<dyn QaService>,
        host: Arc<dyn HostPage>,
        player: Arc<dyn PlayerControl>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let ingest = IngestCoordinator::new(store.clone(), service.clone(), config);
        let queries = QueryCoordinator::new(store.clone(), service);
        let background = Background::new(
            store.clone(),
            ingest.clone(),
            queries.clone(),
            host.clone(),
            player,
        );

        let migration = background.migrate_legacy(host.current_location().as_ref())?;

        let (client, requests) = channel::channel(CHANNEL_BUFFER);
        let projector = Projector::new(store.clone(), client.clone())?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(background.serve(requests, cancel.clone())));
        tasks.push(projector.spawn(cancel.clone()));

        let observer = LocationObserver::new(host, config.polling.location_interval());
        let (mut locations, observer_task) = observer.spawn(cancel.clone());
        tasks.push(observer_task);

        let forward = client.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(location) = locations.recv().await {
                if let Err(e) = forward.url_changed(&location).await {
                    tracing::warn!(error = %e, "Could not forward location");
                    break;
                }
            }
        }));

        tracing::info!(?migration, "Synchronizer started");
        Ok(Self {
            store,
            ingest,
            queries,
            projector,
            channel: client,
            migration,
            cancel,
            tasks,
        })
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn ingest(&self) -> &IngestCoordinator {
        &self.ingest
    }

    /// Client for raw message-channel requests
    pub fn channel(&self) -> &ChannelClient {
        &self.channel
    }

    /// What the startup legacy migration did
    pub fn migration(&self) -> &MigrationOutcome {
        &self.migration
    }

    /// Cancel every loop and wait for the tasks to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.ingest.shutdown();
        self.queries.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Task ended abnormally");
            }
        }
        tracing::info!("Synchronizer stopped");
    }
}
