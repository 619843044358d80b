//! # vidqa-core
//!
//! Client-side session-state synchronizer for a video question-answering
//! assistant.
//!
//! This library provides:
//! - Location observation with de-duplicated change events
//! - A persistent session store (one conversation per video) on SQLite
//! - Ingestion coordination: at-most-once indexing requests and status polling
//! - Query coordination: per-session serialized question/answer exchanges
//! - A state projector for presentation
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Two logically separate contexts share only the store and a message channel:
//! - **Background:** observer events, ingestion, queries, player control
//! - **Presentation:** the [`Projector`], which follows store notifications
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vidqa_core::{Config, Database, ServiceClient, SessionStore};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! let store = SessionStore::new(Arc::new(db));
//!
//! let service = ServiceClient::new(&config.service).expect("failed to build client");
//! ```

// Re-export commonly used items at the crate root
pub use background::{Background, PlayerControl};
pub use channel::{ChannelClient, Request, Response};
pub use config::Config;
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use ingest::{IngestCoordinator, ObserveOutcome};
pub use observer::{HostPage, LocationObserver, SimulatedPage};
pub use projector::{Banner, Projector, SessionSummary, ViewState};
pub use query::QueryCoordinator;
pub use runtime::Synchronizer;
pub use service::{QaService, ServiceClient};
pub use store::{MigrationOutcome, SessionStore, StoreEvent};
pub use types::*;

// Public modules
pub mod background;
pub mod channel;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod format;
pub mod ingest;
pub mod logging;
pub mod observer;
pub mod projector;
pub mod query;
pub mod runtime;
pub mod service;
pub mod store;
pub mod types;
